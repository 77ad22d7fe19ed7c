//! Sandbox function table.
//!
//! Guests reach host operations that do not fit the object graph through
//! `hostFunction(fn, args)`: a negative function number selects an entry in
//! [`SANDBOX_FUNCTIONS`], the argument blob is decoded positionally and the
//! result blob is handed back to the guest.
//!
//! Function numbers are part of the guest ABI. Entry `i` in the table has
//! number `-(i + 1)`; new functions are only ever appended.

use tracing::{debug, info};
use wasmhost_types::{Balances, BytesDecoder, BytesEncoder};

use crate::context::WasmContext;
use crate::error::{HostError, HostResult};
use crate::kv::Dict;
use crate::sandbox::{SendMetadata, SendOptions};
use crate::utility;

pub type SandboxFn = fn(&mut WasmContext, &[u8]) -> HostResult<Option<Vec<u8>>>;

pub struct SandboxFunction {
    pub name: &'static str,
    pub func: SandboxFn,
}

const fn entry(name: &'static str, func: SandboxFn) -> SandboxFunction {
    SandboxFunction { name, func }
}

pub const FN_ACCOUNT_ID: i32 = -1;
pub const FN_BALANCE: i32 = -2;
pub const FN_BALANCES: i32 = -3;
pub const FN_CALL: i32 = -4;
pub const FN_CALLER: i32 = -5;
pub const FN_CHAIN_ID: i32 = -6;
pub const FN_CHAIN_OWNER_ID: i32 = -7;
pub const FN_CONTRACT: i32 = -8;
pub const FN_CONTRACT_CREATOR: i32 = -9;
pub const FN_DEPLOY_CONTRACT: i32 = -10;
pub const FN_ENTROPY: i32 = -11;
pub const FN_EVENT: i32 = -12;
pub const FN_INCOMING_TRANSFER: i32 = -13;
pub const FN_LOG: i32 = -14;
pub const FN_MINTED: i32 = -15;
pub const FN_PANIC: i32 = -16;
pub const FN_PARAMS: i32 = -17;
pub const FN_POST: i32 = -18;
pub const FN_REQUEST_ID: i32 = -19;
pub const FN_RESULTS: i32 = -20;
pub const FN_SEND: i32 = -21;
pub const FN_TIMESTAMP: i32 = -22;
pub const FN_TRACE: i32 = -23;
pub const FN_UTILS_BASE58_DECODE: i32 = -24;
pub const FN_UTILS_BASE58_ENCODE: i32 = -25;
pub const FN_UTILS_BLS_ADDRESS: i32 = -26;
pub const FN_UTILS_BLS_AGGREGATE: i32 = -27;
pub const FN_UTILS_BLS_VALID: i32 = -28;
pub const FN_UTILS_ED25519_ADDRESS: i32 = -29;
pub const FN_UTILS_ED25519_VALID: i32 = -30;
pub const FN_UTILS_HASH_BLAKE2B: i32 = -31;
pub const FN_UTILS_HASH_NAME: i32 = -32;
pub const FN_UTILS_HASH_SHA3: i32 = -33;

pub static SANDBOX_FUNCTIONS: [SandboxFunction; 33] = [
    entry("AccountID", fn_account_id),
    entry("Balance", fn_balance),
    entry("Balances", fn_balances),
    entry("Call", fn_call),
    entry("Caller", fn_caller),
    entry("ChainID", fn_chain_id),
    entry("ChainOwnerID", fn_chain_owner_id),
    entry("Contract", fn_contract),
    entry("ContractCreator", fn_contract_creator),
    entry("DeployContract", fn_deploy_contract),
    entry("Entropy", fn_entropy),
    entry("Event", fn_event),
    entry("IncomingTransfer", fn_incoming_transfer),
    entry("Log", fn_log),
    entry("Minted", fn_minted),
    entry("Panic", fn_panic),
    entry("Params", fn_params),
    entry("Post", fn_post),
    entry("RequestID", fn_request_id),
    entry("Results", fn_results),
    entry("Send", fn_send),
    entry("Timestamp", fn_timestamp),
    entry("Trace", fn_trace),
    entry("Base58Decode", fn_utils_base58_decode),
    entry("Base58Encode", fn_utils_base58_encode),
    entry("BlsAddress", fn_utils_bls_address),
    entry("BlsAggregate", fn_utils_bls_aggregate),
    entry("BlsValid", fn_utils_bls_valid),
    entry("Ed25519Address", fn_utils_ed25519_address),
    entry("Ed25519Valid", fn_utils_ed25519_valid),
    entry("HashBlake2b", fn_utils_hash_blake2b),
    entry("HashName", fn_utils_hash_name),
    entry("HashSha3", fn_utils_hash_sha3),
];

/// Table entry for a function number.
pub fn lookup(fn_nr: i32) -> Option<&'static SandboxFunction> {
    if fn_nr >= 0 {
        return None;
    }
    let index = usize::try_from(-i64::from(fn_nr) - 1).ok()?;
    SANDBOX_FUNCTIONS.get(index)
}

/// Function numbers and names in table order.
pub fn functions() -> impl Iterator<Item = (i32, &'static str)> {
    SANDBOX_FUNCTIONS
        .iter()
        .zip(1i32..)
        .map(|(f, n)| (-n, f.name))
}

pub fn dispatch(ctx: &mut WasmContext, fn_nr: i32, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let function = lookup(fn_nr)
        .ok_or_else(|| HostError::protocol(format!("unknown sandbox function {fn_nr}")))?;
    if ctx.trace_dispatch() {
        debug!(
            call_id = ctx.call_id(),
            function = function.name,
            args = args.len(),
            "sandbox function"
        );
    }
    (function.func)(ctx, args)
}

fn no_args(args: &[u8]) -> HostResult<()> {
    BytesDecoder::new(args).finish()?;
    Ok(())
}

fn utf8(args: &[u8]) -> HostResult<&str> {
    std::str::from_utf8(args).map_err(|_| HostError::protocol("argument is not utf-8"))
}

fn non_empty(transfer: Balances) -> HostResult<Balances> {
    if transfer.is_empty() {
        return Err(HostError::domain("transfer carries no tokens"));
    }
    Ok(transfer)
}

fn bool_result(value: bool) -> Option<Vec<u8>> {
    Some(vec![u8::from(value)])
}

fn fn_account_id(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.account_id().to_vec()))
}

fn fn_balance(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let color = dec.read_color()?;
    dec.finish()?;
    Ok(Some(ctx.sandbox()?.balance(&color).to_le_bytes().to_vec()))
}

fn fn_balances(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.balances().to_bytes()))
}

fn fn_call(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let contract = dec.read_hname()?;
    let function = dec.read_hname()?;
    let params = Dict::from_bytes(dec.read_bytes()?)?;
    let transfer = Balances::from_bytes(dec.read_bytes()?)?;
    dec.finish()?;

    let sandbox = ctx.sandbox()?.clone();
    let results = {
        let _released = ctx.instance_lock().release_scoped();
        sandbox.call(contract, function, params, transfer)?
    };
    let blob = results.to_bytes();
    ctx.replace_return(results)?;
    Ok(Some(blob))
}

fn fn_caller(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.full()?.caller().to_vec()))
}

fn fn_chain_id(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.chain_id().to_vec()))
}

fn fn_chain_owner_id(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.chain_owner_id().to_vec()))
}

fn fn_contract(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.contract().to_bytes().to_vec()))
}

fn fn_contract_creator(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.contract_creator().to_vec()))
}

fn fn_deploy_contract(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let program_hash = dec.read_hash()?;
    let name = dec.read_string()?;
    let description = dec.read_string()?;
    let init_params = Dict::from_bytes(dec.read_bytes()?)?;
    dec.finish()?;

    let sandbox = ctx.sandbox()?.clone();
    let full = sandbox.full()?;
    {
        let _released = ctx.instance_lock().release_scoped();
        full.deploy_contract(&program_hash, &name, &description, init_params)
            .map_err(HostError::from_sandbox)?;
    }
    Ok(None)
}

fn fn_entropy(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.full()?.entropy().to_vec()))
}

fn fn_event(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let msg = utf8(args)?;
    ctx.sandbox()?.full()?.event(msg);
    Ok(None)
}

fn fn_incoming_transfer(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.full()?.incoming_transfer().to_bytes()))
}

fn fn_log(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let msg = utf8(args)?;
    info!(target: "wasmhost::guest", "{msg}");
    if let Ok(sandbox) = ctx.sandbox() {
        sandbox.log(msg);
    }
    Ok(None)
}

fn fn_minted(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.full()?.minted().to_bytes()))
}

fn fn_panic(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Err(HostError::domain(String::from_utf8_lossy(args)))
}

fn fn_params(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.params().to_bytes()))
}

fn fn_post(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let chain_id = dec.read_chain_id()?;
    let target_contract = dec.read_hname()?;
    let entry_point = dec.read_hname()?;
    let params = Dict::from_bytes(dec.read_bytes()?)?;
    let transfer = Balances::from_bytes(dec.read_bytes()?)?;
    let delay = dec.read_uvarint()?;
    dec.finish()?;
    let transfer = non_empty(transfer)?;

    let sandbox = ctx.sandbox()?.clone();
    let full = sandbox.full()?;
    let time_lock = if delay > 0 {
        let now = u64::try_from(full.timestamp() / 1_000_000_000)
            .map_err(|_| HostError::domain("timestamp before the epoch"))?;
        let unlock = now
            .checked_add(delay)
            .and_then(|t| u32::try_from(t).ok())
            .ok_or_else(|| HostError::domain(format!("delay {delay} overflows the time lock")))?;
        Some(unlock)
    } else {
        None
    };
    let metadata = SendMetadata {
        target_contract,
        entry_point,
        args: params,
    };
    {
        let _released = ctx.instance_lock().release_scoped();
        full.send(
            &chain_id.address(),
            &transfer,
            Some(metadata),
            SendOptions { time_lock },
        )
        .map_err(HostError::from_sandbox)?;
    }
    Ok(None)
}

fn fn_request_id(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.full()?.request_id().to_vec()))
}

fn fn_results(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let results = Dict::from_bytes(args)?;
    ctx.replace_results(&results);
    Ok(None)
}

fn fn_send(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let target = dec.read_address()?;
    let transfer = Balances::from_bytes(dec.read_bytes()?)?;
    dec.finish()?;
    let transfer = non_empty(transfer)?;

    ctx.sandbox()?
        .full()?
        .send(&target, &transfer, None, SendOptions::default())
        .map_err(HostError::from_sandbox)?;
    Ok(None)
}

fn fn_timestamp(ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    no_args(args)?;
    Ok(Some(ctx.sandbox()?.timestamp().to_le_bytes().to_vec()))
}

fn fn_trace(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    debug!(target: "wasmhost::guest", "{}", utf8(args)?);
    Ok(None)
}

fn fn_utils_base58_decode(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Ok(Some(utility::base58_decode(utf8(args)?)?))
}

fn fn_utils_base58_encode(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Ok(Some(utility::base58_encode(args).into_bytes()))
}

fn fn_utils_bls_address(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let public_key = dec.read_fixed(utility::BLS_PUBLIC_KEY_LENGTH)?;
    dec.finish()?;
    Ok(Some(utility::bls_address(public_key)?.to_vec()))
}

fn fn_utils_bls_aggregate(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let mut public_keys = Vec::new();
    for _ in 0..dec.read_uvarint()? {
        public_keys.push(dec.read_bytes()?.to_vec());
    }
    let mut signatures = Vec::new();
    for _ in 0..dec.read_uvarint()? {
        signatures.push(dec.read_bytes()?.to_vec());
    }
    dec.finish()?;

    let (public_key, signature) = utility::bls_aggregate(&public_keys, &signatures)?;
    let mut enc = BytesEncoder::new();
    enc.write_bytes(&public_key).write_bytes(&signature);
    Ok(Some(enc.into_bytes()))
}

fn fn_utils_bls_valid(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let data = dec.read_bytes()?;
    let public_key = dec.read_bytes()?;
    let signature = dec.read_bytes()?;
    dec.finish()?;
    Ok(bool_result(utility::bls_valid(data, public_key, signature)))
}

fn fn_utils_ed25519_address(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let public_key = dec.read_fixed(utility::ED25519_PUBLIC_KEY_LENGTH)?;
    dec.finish()?;
    Ok(Some(utility::ed25519_address(public_key)?.to_vec()))
}

fn fn_utils_ed25519_valid(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    let mut dec = BytesDecoder::new(args);
    let data = dec.read_bytes()?;
    let public_key = dec.read_bytes()?;
    let signature = dec.read_bytes()?;
    dec.finish()?;
    Ok(bool_result(utility::ed25519_valid(data, public_key, signature)))
}

fn fn_utils_hash_blake2b(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Ok(Some(utility::blake2b(args).to_vec()))
}

fn fn_utils_hash_name(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Ok(Some(utility::hname_from_name(utf8(args)?).to_bytes().to_vec()))
}

fn fn_utils_hash_sha3(_ctx: &mut WasmContext, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
    Ok(Some(utility::sha3(args).to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::lock::InstanceLock;
    use std::sync::Arc;

    fn load_phase() -> WasmContext {
        let mut ctx = WasmContext::new(Arc::new(InstanceLock::new()), &HostConfig::default());
        ctx.begin().unwrap();
        ctx
    }

    fn call(ctx: &mut WasmContext, fn_nr: i32, args: &[u8]) -> HostResult<Option<Vec<u8>>> {
        let len = ctx.call_function(fn_nr, args)?;
        let result = ctx.take_function_result();
        assert_eq!(len, result.as_ref().map_or(-1, |r| r.len() as i32));
        Ok(result)
    }

    #[test]
    fn function_numbers_follow_table_order() {
        assert_eq!(lookup(FN_ACCOUNT_ID).unwrap().name, "AccountID");
        assert_eq!(lookup(FN_SEND).unwrap().name, "Send");
        assert_eq!(lookup(FN_UTILS_HASH_SHA3).unwrap().name, "HashSha3");
        assert!(lookup(0).is_none());
        assert!(lookup(-34).is_none());
        assert!(lookup(i32::MIN).is_none());
        let all: Vec<_> = functions().collect();
        assert_eq!(all.len(), 33);
        assert_eq!(all[3], (FN_CALL, "Call"));
    }

    #[test]
    fn unknown_function_is_a_protocol_error() {
        let mut ctx = load_phase();
        assert!(matches!(call(&mut ctx, -34, &[]), Err(HostError::Protocol(_))));
        assert!(matches!(call(&mut ctx, -1000, &[]), Err(HostError::Protocol(_))));
    }

    #[test]
    fn base58_functions_are_inverse() {
        let mut ctx = load_phase();
        let data = b"\x00\x00hello world".to_vec();
        let encoded = call(&mut ctx, FN_UTILS_BASE58_ENCODE, &data).unwrap().unwrap();
        let decoded = call(&mut ctx, FN_UTILS_BASE58_DECODE, &encoded).unwrap().unwrap();
        assert_eq!(decoded, data);
        assert!(matches!(
            call(&mut ctx, FN_UTILS_BASE58_DECODE, b"0OIl"),
            Err(HostError::Domain(_))
        ));
    }

    #[test]
    fn hashes_are_deterministic() {
        let mut ctx = load_phase();
        let a = call(&mut ctx, FN_UTILS_HASH_BLAKE2B, b"abc").unwrap().unwrap();
        let b = call(&mut ctx, FN_UTILS_HASH_BLAKE2B, b"abc").unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let sha = call(&mut ctx, FN_UTILS_HASH_SHA3, b"abc").unwrap().unwrap();
        assert_ne!(a, sha);
        let hname = call(&mut ctx, FN_UTILS_HASH_NAME, b"increment").unwrap().unwrap();
        assert_eq!(hname, utility::hname_from_name("increment").to_bytes().to_vec());
    }

    #[test]
    fn signature_checks_return_a_bool_byte() {
        let mut ctx = load_phase();
        let mut enc = BytesEncoder::new();
        enc.write_bytes(b"data").write_bytes(&[0; 32]).write_bytes(&[0; 64]);
        let args = enc.into_bytes();
        assert_eq!(call(&mut ctx, FN_UTILS_ED25519_VALID, &args).unwrap(), Some(vec![0]));
        assert_eq!(call(&mut ctx, FN_UTILS_BLS_VALID, &args).unwrap(), Some(vec![0]));
        assert!(matches!(
            call(&mut ctx, FN_UTILS_ED25519_VALID, &args[..5]),
            Err(HostError::Protocol(_))
        ));
    }

    #[test]
    fn panic_fails_with_its_message() {
        let mut ctx = load_phase();
        assert_eq!(
            call(&mut ctx, FN_PANIC, b"insufficient funds").unwrap_err(),
            HostError::domain("insufficient funds")
        );
    }

    #[test]
    fn results_replace_the_result_dict() {
        let mut ctx = load_phase();
        ctx.results().insert(b"old".to_vec(), b"1".to_vec());
        let fresh = Dict::new();
        fresh.insert(b"new".to_vec(), b"2".to_vec());
        assert_eq!(call(&mut ctx, FN_RESULTS, &fresh.to_bytes()).unwrap(), None);
        assert_eq!(ctx.results(), &fresh);
    }

    #[test]
    fn chain_queries_need_a_bound_sandbox() {
        let mut ctx = load_phase();
        assert!(matches!(
            call(&mut ctx, FN_CHAIN_ID, &[]),
            Err(HostError::Capability(_))
        ));
        assert!(call(&mut ctx, FN_LOG, b"loading").unwrap().is_none());
    }

    #[test]
    fn trailing_arguments_are_rejected() {
        let mut ctx = load_phase();
        assert!(matches!(
            call(&mut ctx, FN_ACCOUNT_ID, &[1]),
            Err(HostError::Protocol(_))
        ));
    }
}
