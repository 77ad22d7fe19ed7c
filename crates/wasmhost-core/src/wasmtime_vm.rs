//! wasmtime binding of the `WasmLib` guest ABI.
//!
//! Five imports, all `i32` in and out:
//!
//! | import            | signature                                   |
//! |-------------------|---------------------------------------------|
//! | `hostGetBytes`    | `(obj, key, type, ptr, size) -> len`        |
//! | `hostGetObjectID` | `(obj, key, type) -> obj`                   |
//! | `hostSetBytes`    | `(obj, key, type, ptr, size)`               |
//! | `hostGetKeyID`    | `(ptr, size) -> key`                        |
//! | `hostFunction`    | `(fn, args, args_len, res, res_size) -> len`|
//!
//! A failing or panicking import records the error on the context and
//! traps, so the first failure of a call is the one reported.

use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, Store};

use crate::config::HostConfig;
use crate::context::WasmContext;
use crate::error::{HostError, HostResult};
use crate::vm::{GuestEntry, WasmVm};

const MODULE: &str = "WasmLib";

/// Store data of one guest run.
pub struct GuestState {
    ctx: WasmContext,
}

pub struct WasmtimeVm {
    engine: Engine,
    module: Module,
    linker: Linker<GuestState>,
    fuel_limit: Option<u64>,
}

fn guest_error(err: anyhow::Error) -> HostError {
    match err.downcast::<HostError>() {
        Ok(host) => host,
        Err(other) => HostError::Guest(format!("{other:#}")),
    }
}

impl WasmtimeVm {
    /// Compile `bytes`, which may be a binary module or WAT text.
    pub fn new(bytes: &[u8], config: &HostConfig) -> HostResult<Self> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(config.fuel_limit.is_some());
        let engine = Engine::new(&engine_config).map_err(guest_error)?;
        let module = Module::new(&engine, bytes).map_err(guest_error)?;
        let mut linker = Linker::new(&engine);
        link_host_functions(&mut linker).map_err(guest_error)?;
        Ok(Self {
            engine,
            module,
            linker,
            fuel_limit: config.fuel_limit,
        })
    }

    /// Names the module exports, including non-function exports.
    pub fn module_exports(&self) -> Vec<String> {
        self.module.exports().map(|e| e.name().to_string()).collect()
    }

    fn execute(&self, store: &mut Store<GuestState>, entry: &GuestEntry) -> HostResult<()> {
        if let Some(fuel) = self.fuel_limit {
            store.set_fuel(fuel).map_err(guest_error)?;
        }
        let instance = self
            .linker
            .instantiate(&mut *store, &self.module)
            .map_err(guest_error)?;

        match entry {
            GuestEntry::OnLoad => match instance.get_func(&mut *store, "on_load") {
                None => Ok(()),
                Some(func) => func
                    .typed::<(), ()>(&*store)
                    .and_then(|f| f.call(&mut *store, ()))
                    .map_err(guest_error),
            },
            GuestEntry::Call { name, index } => {
                let on_call = instance.get_func(&mut *store, "on_call");
                match (on_call, index) {
                    (Some(func), Some(index)) => {
                        let index = i32::try_from(*index)
                            .map_err(|_| HostError::internal("export index overflow"))?;
                        func.typed::<i32, ()>(&*store)
                            .and_then(|f| f.call(&mut *store, index))
                            .map_err(guest_error)
                    }
                    _ => {
                        let func = instance.get_func(&mut *store, name).ok_or_else(|| {
                            HostError::domain(format!("guest does not export {name}"))
                        })?;
                        func.typed::<(), ()>(&*store)
                            .and_then(|f| f.call(&mut *store, ()))
                            .map_err(guest_error)
                    }
                }
            }
        }
    }
}

impl WasmVm for WasmtimeVm {
    fn run(&self, ctx: WasmContext, entry: &GuestEntry) -> (WasmContext, HostResult<()>) {
        let mut store = Store::new(&self.engine, GuestState { ctx });
        let outcome = self.execute(&mut store, entry);
        (store.into_data().ctx, outcome)
    }
}

// =============================================================================
// Guest memory
// =============================================================================

fn memory(caller: &mut Caller<'_, GuestState>) -> HostResult<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| HostError::protocol("guest does not export memory"))
}

fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> HostResult<Vec<u8>> {
    let (offset, len) = match (usize::try_from(ptr), usize::try_from(len)) {
        (Ok(offset), Ok(len)) => (offset, len),
        _ => return Err(HostError::protocol(format!("bad guest buffer {ptr}+{len}"))),
    };
    let memory = memory(caller)?;
    let mut buf = vec![0u8; len];
    memory
        .read(&*caller, offset, &mut buf)
        .map_err(|_| HostError::protocol(format!("guest buffer {ptr}+{len} out of bounds")))?;
    Ok(buf)
}

/// Copy as much of `data` as fits in `size` bytes at `ptr`.
fn write_guest(
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    size: i32,
    data: &[u8],
) -> HostResult<()> {
    let size = usize::try_from(size).unwrap_or(0);
    let count = size.min(data.len());
    if count == 0 {
        return Ok(());
    }
    let offset = usize::try_from(ptr)
        .map_err(|_| HostError::protocol(format!("bad guest buffer {ptr}")))?;
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, offset, &data[..count])
        .map_err(|_| HostError::protocol(format!("guest buffer {ptr}+{count} out of bounds")))
}

fn length(bytes: &[u8]) -> HostResult<i32> {
    i32::try_from(bytes.len()).map_err(|_| HostError::internal("value too large for the guest"))
}

/// Run one import. A failure or panic is recorded on the context and
/// becomes a trap.
fn guarded<'c, T>(
    caller: &mut Caller<'c, GuestState>,
    op: impl FnOnce(&mut Caller<'c, GuestState>) -> HostResult<T>,
) -> anyhow::Result<T> {
    let result = HostError::catch(|| op(&mut *caller));
    result.map_err(|err| anyhow::Error::new(caller.data_mut().ctx.record_error(err)))
}

// =============================================================================
// Imports
// =============================================================================

fn host_get_bytes(
    caller: &mut Caller<'_, GuestState>,
    obj: i32,
    key: i32,
    type_id: i32,
    ptr: i32,
    size: i32,
) -> HostResult<i32> {
    if size < 0 {
        let found = caller.data_mut().ctx.exists(obj, key, type_id)?;
        return Ok(if found { 0 } else { -1 });
    }
    match caller.data_mut().ctx.get_bytes(obj, key, type_id)? {
        None => Ok(-1),
        Some(value) => {
            write_guest(caller, ptr, size, &value)?;
            length(&value)
        }
    }
}

fn host_set_bytes(
    caller: &mut Caller<'_, GuestState>,
    obj: i32,
    key: i32,
    type_id: i32,
    ptr: i32,
    size: i32,
) -> HostResult<()> {
    if size < 0 {
        return caller.data_mut().ctx.del_key(obj, key, type_id);
    }
    let value = read_guest(caller, ptr, size)?;
    caller.data_mut().ctx.set_bytes(obj, key, type_id, &value)
}

fn host_get_key_id(caller: &mut Caller<'_, GuestState>, ptr: i32, size: i32) -> HostResult<i32> {
    if size >= 0 {
        let raw = read_guest(caller, ptr, size)?;
        let key = String::from_utf8(raw)
            .map_err(|_| HostError::protocol("string key is not utf-8"))?;
        return caller.data_mut().ctx.get_key_id_from_string(&key);
    }
    let len = -(size + 1);
    let raw = read_guest(caller, ptr, len)?;
    caller.data_mut().ctx.get_key_id_from_bytes(&raw)
}

fn host_function(
    caller: &mut Caller<'_, GuestState>,
    fn_nr: i32,
    args_ptr: i32,
    args_len: i32,
    res_ptr: i32,
    res_size: i32,
) -> HostResult<i32> {
    match fn_nr {
        n if n < 0 => {
            let args = read_guest(caller, args_ptr, args_len)?;
            caller.data_mut().ctx.call_function(n, &args)
        }
        0 => {
            let result = caller
                .data_mut()
                .ctx
                .take_function_result()
                .ok_or_else(|| HostError::protocol("no function result to retrieve"))?;
            write_guest(caller, res_ptr, res_size, &result)?;
            length(&result)
        }
        n => Err(HostError::protocol(format!("invalid function number {n}"))),
    }
}

fn link_host_functions(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap(
        MODULE,
        "hostGetBytes",
        |mut caller: Caller<'_, GuestState>,
         obj: i32,
         key: i32,
         type_id: i32,
         ptr: i32,
         size: i32|
         -> anyhow::Result<i32> {
            guarded(&mut caller, |c| host_get_bytes(c, obj, key, type_id, ptr, size))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "hostGetObjectID",
        |mut caller: Caller<'_, GuestState>,
         obj: i32,
         key: i32,
         type_id: i32|
         -> anyhow::Result<i32> {
            guarded(&mut caller, |c| c.data_mut().ctx.get_object_id(obj, key, type_id))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "hostSetBytes",
        |mut caller: Caller<'_, GuestState>,
         obj: i32,
         key: i32,
         type_id: i32,
         ptr: i32,
         size: i32|
         -> anyhow::Result<()> {
            guarded(&mut caller, |c| host_set_bytes(c, obj, key, type_id, ptr, size))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "hostGetKeyID",
        |mut caller: Caller<'_, GuestState>, ptr: i32, size: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |c| host_get_key_id(c, ptr, size))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "hostFunction",
        |mut caller: Caller<'_, GuestState>,
         fn_nr: i32,
         args_ptr: i32,
         args_len: i32,
         res_ptr: i32,
         res_size: i32|
         -> anyhow::Result<i32> {
            guarded(&mut caller, |c| {
                host_function(c, fn_nr, args_ptr, args_len, res_ptr, res_size)
            })
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_modules_are_guest_errors() {
        let err = WasmtimeVm::new(b"not wasm", &HostConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, HostError::Guest(_)));
    }

    #[test]
    fn modules_may_be_given_as_wat() {
        let vm = WasmtimeVm::new(
            br#"(module (memory (export "memory") 1) (func (export "ping")))"#,
            &HostConfig::default(),
        )
        .unwrap();
        let mut exports = vm.module_exports();
        exports.sort();
        assert_eq!(exports, vec!["memory", "ping"]);
    }
}
