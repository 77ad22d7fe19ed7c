//! Call scenarios against the reference chain using Rust-hosted guests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use wasmhost_core::dispatch::{FN_CALL, FN_POST, FN_SEND};
use wasmhost_core::utility::hname_from_name;
use wasmhost_core::{Dict, HostConfig, HostError, HostResult, HostedGuest, LocalChain, WasmContext};
use wasmhost_types::keys::{
    KEY_BALANCES, KEY_MAPS, KEY_RESULTS, KEY_RETURN, KEY_STATE, KEY_TIMESTAMP,
};
use wasmhost_types::{
    Balances, BytesEncoder, ScAddress, ScColor, ScHname, TypeKind, TypeTag, OBJ_ID_ROOT,
};

fn set_result(ctx: &mut WasmContext, key: &str, type_tag: TypeTag, value: &[u8]) -> HostResult<()> {
    let results = ctx.get_object_id(OBJ_ID_ROOT, KEY_RESULTS, TypeTag::MAP.as_i32())?;
    let key = ctx.get_key_id_from_string(key)?;
    ctx.set_bytes(results, key, type_tag.as_i32(), value)
}

fn send_args(target: &ScAddress, transfer: &Balances) -> Vec<u8> {
    let mut enc = BytesEncoder::new();
    enc.write_fixed(target.as_bytes()).write_bytes(&transfer.to_bytes());
    enc.into_bytes()
}

// =============================================================================
// Object identity
// =============================================================================

#[test]
fn test_object_ids_are_stable_within_a_call() {
    let chain = LocalChain::new(HostConfig::default());
    let guest = HostedGuest::new().with_function("inspect", |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        assert_eq!(ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?, state);

        let nested_key = ctx.get_key_id_from_string("nested")?;
        let nested = ctx.get_object_id(state, nested_key, TypeTag::MAP.as_i32())?;
        assert_eq!(ctx.get_object_id(state, nested_key, TypeTag::MAP.as_i32())?, nested);
        assert_ne!(nested, state);

        let maps = ctx.get_object_id(OBJ_ID_ROOT, KEY_MAPS, TypeTag::Array(TypeKind::Map).as_i32())?;
        let first = ctx.get_object_id(maps, 0, TypeTag::MAP.as_i32())?;
        assert_eq!(ctx.get_object_id(maps, 0, TypeTag::MAP.as_i32())?, first);
        assert!(ctx.get_object_id(maps, 2, TypeTag::MAP.as_i32()).is_err());
        Ok(())
    });
    let hname = chain.deploy_hosted("inspector", guest, Dict::new()).unwrap();
    chain
        .post_request(hname, "inspect", Dict::new(), chain.owner(), Balances::new())
        .unwrap();
}

// =============================================================================
// Type slots
// =============================================================================

#[test]
fn test_counter_slot_keeps_its_first_type() {
    let chain = LocalChain::new(HostConfig::default());
    let guest = HostedGuest::new().with_function("store", |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("counter")?;
        ctx.set_bytes(state, key, TypeTag::INT64.as_i32(), &42i64.to_le_bytes())?;
        ctx.get_bytes(state, key, TypeTag::STRING.as_i32()).map(|_| ())
    });
    let hname = chain.deploy_hosted("store", guest, Dict::new()).unwrap();
    let err = chain
        .post_request(hname, "store", Dict::new(), chain.owner(), Balances::new())
        .unwrap_err();
    assert!(matches!(err, HostError::TypeMismatch { .. }), "got {err:?}");
}

// =============================================================================
// Value transfers
// =============================================================================

#[test]
fn test_zero_value_send_never_reaches_the_ledger() {
    let chain = LocalChain::new(HostConfig::default());
    let target = chain.owner().address();
    let outcome = Arc::new(parking_lot::Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let guest = HostedGuest::new().with_function("pay", move |ctx| {
        let empty = send_args(&target, &Balances::new());
        *seen.lock() = Some(ctx.call_function(FN_SEND, &empty));
        Ok(())
    });
    let hname = chain.deploy_hosted("payer", guest, Dict::new()).unwrap();
    chain
        .post_request(hname, "pay", Dict::new(), chain.owner(), Balances::new())
        .unwrap();

    let result = outcome.lock().take().expect("guest ran");
    assert!(matches!(result, Err(HostError::Domain(_))), "got {result:?}");
    assert!(chain.sent_requests().is_empty());
}

#[test]
fn test_send_moves_tokens_out_of_the_contract() {
    let chain = LocalChain::new(HostConfig::default());
    let target = chain.owner().address();
    let guest = HostedGuest::new().with_function("pay", move |ctx| {
        let args = send_args(&target, &Balances::new().with(ScColor::IOTA, 3));
        ctx.call_function(FN_SEND, &args).map(|_| ())
    });
    let hname = chain.deploy_hosted("payer", guest, Dict::new()).unwrap();
    chain
        .post_request(
            hname,
            "pay",
            Dict::new(),
            chain.owner(),
            Balances::new().with(ScColor::IOTA, 10),
        )
        .unwrap();

    let sent = chain.sent_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, target);
    assert_eq!(sent[0].transfer.balance(&ScColor::IOTA), 3);
    assert_eq!(
        chain.balances(&chain.agent_id(hname)).balance(&ScColor::IOTA),
        7
    );
}

#[test]
fn test_balances_node_follows_value_moved_during_the_call() {
    let chain = LocalChain::new(HostConfig::default());
    let target = chain.owner().address();
    let guest = HostedGuest::new().with_function("pay", move |ctx| {
        let balances = ctx.get_object_id(OBJ_ID_ROOT, KEY_BALANCES, TypeTag::MAP.as_i32())?;
        let iota = ctx.get_key_id_from_bytes(ScColor::IOTA.as_bytes())?;
        let before = ctx
            .get_bytes(balances, iota, TypeTag::INT64.as_i32())?
            .expect("credited");
        set_result(ctx, "before", TypeTag::INT64, &before)?;

        let args = send_args(&target, &Balances::new().with(ScColor::IOTA, 3));
        ctx.call_function(FN_SEND, &args)?;

        let after = ctx
            .get_bytes(balances, iota, TypeTag::INT64.as_i32())?
            .expect("still holds tokens");
        set_result(ctx, "after", TypeTag::INT64, &after)
    });
    let hname = chain.deploy_hosted("payer", guest, Dict::new()).unwrap();
    let results = chain
        .post_request(
            hname,
            "pay",
            Dict::new(),
            chain.owner(),
            Balances::new().with(ScColor::IOTA, 10),
        )
        .unwrap();

    assert_eq!(results.get_value(b"before"), Some(10u64.to_le_bytes().to_vec()));
    assert_eq!(results.get_value(b"after"), Some(7u64.to_le_bytes().to_vec()));
}

#[test]
fn test_post_with_delay_sets_a_time_lock() {
    let chain = LocalChain::new(HostConfig::default());
    let chain_id = chain.chain_id();
    let guest = HostedGuest::new().with_function("schedule", move |ctx| {
        let mut enc = BytesEncoder::new();
        enc.write_fixed(chain_id.as_bytes())
            .write_hname(hname_from_name("other"))
            .write_hname(hname_from_name("run"))
            .write_bytes(&Dict::new().to_bytes())
            .write_bytes(&Balances::new().with(ScColor::IOTA, 1).to_bytes())
            .write_uvarint(60);
        ctx.call_function(FN_POST, &enc.into_bytes())?;

        let ts = ctx
            .get_bytes(OBJ_ID_ROOT, KEY_TIMESTAMP, TypeTag::INT64.as_i32())?
            .expect("timestamp");
        set_result(ctx, "ts", TypeTag::INT64, &ts)
    });
    let hname = chain.deploy_hosted("scheduler", guest, Dict::new()).unwrap();
    let results = chain
        .post_request(
            hname,
            "schedule",
            Dict::new(),
            chain.owner(),
            Balances::new().with(ScColor::IOTA, 1),
        )
        .unwrap();

    let ts = i64::from_le_bytes(results.get_value(b"ts").unwrap().try_into().unwrap());
    let sent = chain.sent_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, chain_id.address());
    let metadata = sent[0].metadata.as_ref().expect("post carries metadata");
    assert_eq!(metadata.entry_point, hname_from_name("run"));
    assert_eq!(
        sent[0].options.time_lock,
        Some((ts / 1_000_000_000) as u32 + 60)
    );
}

// =============================================================================
// Nested calls
// =============================================================================

fn callee() -> HostedGuest {
    HostedGuest::new().with_function("answer", |ctx| {
        set_result(ctx, "answer", TypeTag::INT32, &42i32.to_le_bytes())
    })
}

fn call_args(contract: ScHname, function: ScHname, transfer: &Balances) -> Vec<u8> {
    let mut enc = BytesEncoder::new();
    enc.write_hname(contract)
        .write_hname(function)
        .write_bytes(&Dict::new().to_bytes())
        .write_bytes(&transfer.to_bytes());
    enc.into_bytes()
}

#[test]
fn test_nested_call_results_appear_under_return() {
    let chain = LocalChain::new(HostConfig::default());
    let callee_hname = chain.deploy_hosted("callee", callee(), Dict::new()).unwrap();
    let guest = HostedGuest::new().with_function("ask", move |ctx| {
        let args = call_args(callee_hname, hname_from_name("answer"), &Balances::new());
        let len = ctx.call_function(FN_CALL, &args)?;
        let blob = ctx.take_function_result().expect("call returns a dict");
        assert_eq!(len as usize, blob.len());
        assert_eq!(
            Dict::from_bytes(&blob).unwrap().get_value(b"answer"),
            Some(42i32.to_le_bytes().to_vec())
        );

        let returned = ctx.get_object_id(OBJ_ID_ROOT, KEY_RETURN, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("answer")?;
        let value = ctx
            .get_bytes(returned, key, TypeTag::INT32.as_i32())?
            .expect("answer in return");
        set_result(ctx, "relayed", TypeTag::INT32, &value)
    });
    let caller_hname = chain.deploy_hosted("caller", guest, Dict::new()).unwrap();
    let results = chain
        .post_request(caller_hname, "ask", Dict::new(), chain.owner(), Balances::new())
        .unwrap();
    assert_eq!(
        results.get_value(b"relayed"),
        Some(42i32.to_le_bytes().to_vec())
    );
}

#[test]
fn test_view_calls_cannot_carry_value() {
    let chain = LocalChain::new(HostConfig::default());
    let callee_hname = chain.deploy_hosted("callee", callee(), Dict::new()).unwrap();
    let guest = HostedGuest::new().with_function("peek", move |ctx| {
        let args = call_args(
            callee_hname,
            hname_from_name("answer"),
            &Balances::new().with(ScColor::IOTA, 1),
        );
        ctx.call_function(FN_CALL, &args).map(|_| ())
    });
    let hname = chain.deploy_hosted("peeker", guest, Dict::new()).unwrap();
    let err = chain.call_view(hname, "peek", Dict::new()).unwrap_err();
    assert!(matches!(err, HostError::Capability(_)), "got {err:?}");
}

#[test]
fn test_contract_may_call_itself() {
    let chain = LocalChain::new(HostConfig::default());
    let depth = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&depth);
    let guest = HostedGuest::new().with_function("recurse", move |ctx| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            let me = hname_from_name("recursive");
            let args = call_args(me, hname_from_name("recurse"), &Balances::new());
            ctx.call_function(FN_CALL, &args)?;
        }
        Ok(())
    });
    let hname = chain.deploy_hosted("recursive", guest, Dict::new()).unwrap();
    chain
        .post_request(hname, "recurse", Dict::new(), chain.owner(), Balances::new())
        .unwrap();
    assert_eq!(depth.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Optimistic reads
// =============================================================================

#[test]
fn test_view_invalidated_mid_read_succeeds_on_retry() {
    let chain = LocalChain::new(HostConfig::default());
    let global = chain.global_state();
    let disturbed = Arc::new(AtomicBool::new(false));
    let disturb = Arc::clone(&disturbed);
    let guest = HostedGuest::new().with_function("read", move |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("counter")?;
        ctx.get_bytes(state, key, TypeTag::INT64.as_i32())?;
        if !disturb.swap(true, Ordering::SeqCst) {
            // a full request commits between two reads of this view
            global.advance();
        }
        ctx.get_bytes(state, key, TypeTag::INT64.as_i32())?;
        Ok(())
    });
    let hname = chain.deploy_hosted("reader", guest, Dict::new()).unwrap();

    let err = chain.call_view(hname, "read", Dict::new()).unwrap_err();
    assert_eq!(err, HostError::StateInvalidated);
    assert!(err.is_retryable());

    chain.call_view(hname, "read", Dict::new()).unwrap();
}

#[test]
fn test_invalidated_index_fails_views_until_restored() {
    let chain = LocalChain::new(HostConfig::default());
    let guest = HostedGuest::new().with_function("read", |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("counter")?;
        ctx.exists(state, key, TypeTag::INT64.as_i32()).map(|_| ())
    });
    let hname = chain.deploy_hosted("reader", guest, Dict::new()).unwrap();
    let global = chain.global_state();
    let index = global.get();

    global.invalidate();
    assert_eq!(
        chain.call_view(hname, "read", Dict::new()).unwrap_err(),
        HostError::StateInvalidated
    );
    global.restore(index);
    chain.call_view(hname, "read", Dict::new()).unwrap();
}

// =============================================================================
// Concurrent requests
// =============================================================================

fn flag_contract() -> HostedGuest {
    HostedGuest::new()
        .with_function("set", |ctx| {
            let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
            let key = ctx.get_key_id_from_string("flag")?;
            ctx.set_bytes(state, key, TypeTag::STRING.as_i32(), b"dirty")
        })
        .with_function("get", |ctx| {
            let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
            let key = ctx.get_key_id_from_string("flag")?;
            match ctx.get_bytes(state, key, TypeTag::STRING.as_i32())? {
                Some(flag) => set_result(ctx, "flag", TypeTag::STRING, &flag),
                None => Ok(()),
            }
        })
}

/// Writes through `flags.set`, parks on `gate` twice, then fails.
fn failing_writer(flags: ScHname, gate: Arc<Barrier>) -> HostedGuest {
    HostedGuest::new().with_function("write_then_fail", move |ctx| {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("own")?;
        ctx.set_bytes(state, key, TypeTag::STRING.as_i32(), b"pending")?;
        let args = call_args(flags, hname_from_name("set"), &Balances::new());
        ctx.call_function(FN_CALL, &args)?;
        gate.wait();
        gate.wait();
        Err(HostError::domain("boom"))
    })
}

#[test]
fn test_view_never_sees_writes_of_a_request_in_flight() {
    let chain = LocalChain::new(HostConfig::default());
    let flags = chain.deploy_hosted("flags", flag_contract(), Dict::new()).unwrap();
    let gate = Arc::new(Barrier::new(2));
    let writer = chain
        .deploy_hosted("writer", failing_writer(flags, Arc::clone(&gate)), Dict::new())
        .unwrap();

    let request = {
        let chain = chain.clone();
        thread::spawn(move || {
            chain.post_request(writer, "write_then_fail", Dict::new(), chain.owner(), Balances::new())
        })
    };

    gate.wait();
    let during = chain.call_view(flags, "get", Dict::new());
    gate.wait();
    let outcome = request.join().expect("request thread");

    assert_eq!(during.unwrap_err(), HostError::StateInvalidated);
    assert_eq!(outcome.unwrap_err(), HostError::domain("boom"));
    let after = chain.call_view(flags, "get", Dict::new()).unwrap();
    assert_eq!(after.get_value(b"flag"), None);
    assert!(chain.state(flags).unwrap().is_empty());
    assert!(chain.state(writer).unwrap().is_empty());
}

#[test]
fn test_rollback_keeps_requests_committed_meanwhile() {
    let chain = LocalChain::new(HostConfig::default());
    let flags = chain.deploy_hosted("flags", flag_contract(), Dict::new()).unwrap();
    let other = chain.deploy_hosted("other", flag_contract(), Dict::new()).unwrap();
    let gate = Arc::new(Barrier::new(2));
    let writer = chain
        .deploy_hosted("writer", failing_writer(flags, Arc::clone(&gate)), Dict::new())
        .unwrap();

    let failing = {
        let chain = chain.clone();
        thread::spawn(move || {
            chain.post_request(writer, "write_then_fail", Dict::new(), chain.owner(), Balances::new())
        })
    };
    gate.wait();
    let committing = {
        let chain = chain.clone();
        thread::spawn(move || {
            chain.post_request(other, "set", Dict::new(), chain.owner(), Balances::new())
        })
    };
    thread::sleep(Duration::from_millis(50));
    gate.wait();

    assert_eq!(
        failing.join().expect("failing thread").unwrap_err(),
        HostError::domain("boom")
    );
    committing.join().expect("committing thread").unwrap();

    assert_eq!(
        chain.state(other).unwrap().get_value(b"flag"),
        Some(b"dirty".to_vec())
    );
    assert_eq!(chain.state(flags).unwrap().get_value(b"flag"), None);
    let view = chain.call_view(other, "get", Dict::new()).unwrap();
    assert_eq!(view.get_value(b"flag"), Some(b"dirty".to_vec()));
}

// =============================================================================
// Panics
// =============================================================================

#[test]
fn test_guest_panic_fails_only_its_request() {
    let chain = LocalChain::new(HostConfig::default());
    let guest = flag_contract().with_function("crash", |_| panic!("guest bug"));
    let hname = chain.deploy_hosted("crasher", guest, Dict::new()).unwrap();

    let err = chain
        .post_request(hname, "crash", Dict::new(), chain.owner(), Balances::new())
        .unwrap_err();
    assert_eq!(err, HostError::internal("panicked: guest bug"));

    chain
        .post_request(hname, "set", Dict::new(), chain.owner(), Balances::new())
        .unwrap();
    let view = chain.call_view(hname, "get", Dict::new()).unwrap();
    assert_eq!(view.get_value(b"flag"), Some(b"dirty".to_vec()));
}

#[test]
fn test_panic_in_a_nested_call_reaches_the_caller() {
    let chain = LocalChain::new(HostConfig::default());
    let crasher = chain
        .deploy_hosted(
            "crasher",
            HostedGuest::new().with_function("crash", |_| panic!("nested bug")),
            Dict::new(),
        )
        .unwrap();
    let guest = HostedGuest::new().with_function("ask", move |ctx| {
        let args = call_args(crasher, hname_from_name("crash"), &Balances::new());
        ctx.call_function(FN_CALL, &args).map(|_| ())
    });
    let caller = chain.deploy_hosted("caller", guest, Dict::new()).unwrap();

    let err = chain
        .post_request(caller, "ask", Dict::new(), chain.owner(), Balances::new())
        .unwrap_err();
    assert_eq!(err, HostError::internal("panicked: nested bug"));
}
