//! Runner and retry behavior through the library API.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{assert_error_contains, assert_ok, counter_contract, counter_state, TestDir};
use wasmhost_core::{Dict, HostConfig, HostError, HostedGuest, LocalChain};
use wasmhost_types::keys::KEY_STATE;
use wasmhost_types::{RetryConfig, TypeTag, OBJ_ID_ROOT};
use wasp_wasmhost::retry::retry_on_invalidated;
use wasp_wasmhost::runner::{run, RunRequest};
use wasp_wasmhost::state_file;

fn request(function: &str, view: bool, state: Option<std::path::PathBuf>) -> RunRequest {
    RunRequest {
        wasm: counter_contract(),
        function: function.to_string(),
        view,
        state_file: state,
        params: Vec::new(),
        config: HostConfig::default(),
    }
}

fn stored_counter(path: &std::path::Path) -> Option<i64> {
    state_file::load(path)
        .unwrap()
        .get_value(b"counter")
        .map(|raw| i64::from_le_bytes(raw.try_into().unwrap()))
}

#[test]
fn test_full_call_writes_state_back() {
    let dir = TestDir::new();
    let state = counter_state(&dir, 41);

    let outcome = assert_ok(run(&request("increment", false, Some(state.clone()))), "increment");
    assert_eq!(outcome.contract, "counter");
    assert_eq!(outcome.state_entries, 1);
    assert_eq!(stored_counter(&state), Some(42));
}

#[test]
fn test_view_call_reads_state_without_writing() {
    let dir = TestDir::new();
    let state = counter_state(&dir, 7);
    let before = std::fs::read_to_string(&state).unwrap();

    let outcome = assert_ok(run(&request("getCounter", true, Some(state.clone()))), "getCounter");
    assert_eq!(
        outcome.results.get_value(b"counter"),
        Some(7i64.to_le_bytes().to_vec())
    );
    assert_eq!(std::fs::read_to_string(&state).unwrap(), before);
}

#[test]
fn test_state_file_is_created_on_first_full_call() {
    let dir = TestDir::new();
    let state = dir.path("fresh.json");
    assert_ok(run(&request("increment", false, Some(state.clone()))), "increment");
    assert_eq!(stored_counter(&state), Some(1));
}

#[test]
fn test_failed_call_leaves_state_file_untouched() {
    let dir = TestDir::new();
    let state = counter_state(&dir, 3);
    let before = std::fs::read_to_string(&state).unwrap();

    let err = run(&request("badRead", false, Some(state.clone()))).unwrap_err();
    assert_error_contains(&err, "type mismatch", "badRead");
    assert_eq!(std::fs::read_to_string(&state).unwrap(), before);
}

#[test]
fn test_missing_contract_is_reported() {
    let mut req = request("increment", false, None);
    req.wasm = TestDir::new().path("nope.wasm");
    let err = run(&req).unwrap_err();
    assert_error_contains(&err, "failed to read contract", "missing wasm");
}

#[test]
fn test_retry_reruns_an_invalidated_view() {
    let chain = LocalChain::new(HostConfig::default());
    let global = chain.global_state();
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&runs);
    let guest = HostedGuest::new().with_function("read", move |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("counter")?;
        ctx.get_bytes(state, key, TypeTag::INT64.as_i32())?;
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            global.advance();
        }
        ctx.get_bytes(state, key, TypeTag::INT64.as_i32()).map(|_| ())
    });
    let hname = chain.deploy_hosted("reader", guest, Dict::new()).unwrap();

    let attempts = AtomicUsize::new(0);
    let cfg = RetryConfig::new(5, 1, 4);
    retry_on_invalidated(&cfg, Duration::from_secs(5), |attempt| {
        attempts.store(attempt + 1, Ordering::SeqCst);
        chain.call_view(hname, "read", Dict::new())
    })
    .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_retry_gives_up_while_state_is_invalid() {
    let chain = LocalChain::new(HostConfig::default());
    let guest = HostedGuest::new().with_function("read", |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("counter")?;
        ctx.get_bytes(state, key, TypeTag::INT64.as_i32()).map(|_| ())
    });
    let hname = chain.deploy_hosted("reader", guest, Dict::new()).unwrap();
    chain.global_state().invalidate();

    let err = retry_on_invalidated(&RetryConfig::new(2, 1, 1), Duration::from_secs(5), |_| {
        chain.call_view(hname, "read", Dict::new())
    })
    .unwrap_err();
    assert_eq!(err, HostError::StateInvalidated);
}
