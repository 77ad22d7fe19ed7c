//! # WasmProcessor: one loaded contract
//!
//! A [`WasmProcessor`] owns a compiled guest, the function names the guest
//! declared while loading, and the instance lock its bytecode runs under.
//! Every call gets a fresh [`WasmContext`]; the engine only ever sees the
//! context, never the chain.
//!
//! ## Key Types
//!
//! - [`WasmVm`]: engine seam. [`WasmtimeVm`](crate::wasmtime_vm::WasmtimeVm)
//!   runs real WASM; [`HostedGuest`] runs Rust closures against the same
//!   context API.
//! - [`GuestEntry`]: what the engine is asked to run.
//!
//! ## Call sequence
//!
//! 1. `load()` runs `on_load` unbound and records the declared exports
//! 2. `call()` binds a sandbox handle, takes the instance lock, runs the entry
//! 3. the context is finalized and the results dict returned

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info_span, warn};
use wasmhost_types::keys::KEY_EXPORTS;
use wasmhost_types::{ScHname, TypeKind, TypeTag, OBJ_ID_ROOT};

use crate::baseline::StateBaseline;
use crate::config::HostConfig;
use crate::context::WasmContext;
use crate::error::{HostError, HostResult};
use crate::kv::Dict;
use crate::lock::InstanceLock;
use crate::sandbox::{Sandbox, SandboxHandle, SandboxView};
use crate::utility::hname_from_name;
use crate::wasmtime_vm::WasmtimeVm;

// =============================================================================
// Engine seam
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestEntry {
    /// Contract load: declares exports, no sandbox bound.
    OnLoad,
    /// An exported function; `index` is its position in the declared exports.
    Call { name: String, index: Option<u32> },
}

/// Runs guest code against a context.
///
/// The engine takes the context by value and hands it back together with
/// the outcome, so host state never outlives the call inside the engine.
pub trait WasmVm: Send + Sync {
    fn run(&self, ctx: WasmContext, entry: &GuestEntry) -> (WasmContext, HostResult<()>);
}

pub type GuestFn = Arc<dyn Fn(&mut WasmContext) -> HostResult<()> + Send + Sync>;

/// A guest written in Rust.
///
/// Functions are declared in registration order during `on_load`, through
/// the same `Exports` array a WASM guest writes.
#[derive(Default, Clone)]
pub struct HostedGuest {
    functions: Vec<(String, GuestFn)>,
}

impl HostedGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut WasmContext) -> HostResult<()> + Send + Sync + 'static,
    {
        self.functions.push((name.into(), Arc::new(func)));
        self
    }

    fn declare_exports(&self, ctx: &mut WasmContext) -> HostResult<()> {
        let exports = ctx.get_object_id(
            OBJ_ID_ROOT,
            KEY_EXPORTS,
            TypeTag::Array(TypeKind::String).as_i32(),
        )?;
        for (index, (name, _)) in self.functions.iter().enumerate() {
            let index = i32::try_from(index)
                .map_err(|_| HostError::internal("too many hosted functions"))?;
            ctx.set_bytes(exports, index, TypeTag::STRING.as_i32(), name.as_bytes())?;
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut WasmContext, name: &str) -> HostResult<()> {
        let (_, func) = self
            .functions
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| HostError::domain(format!("unknown function {name}")))?;
        HostError::catch(|| func(ctx))
    }
}

impl WasmVm for HostedGuest {
    fn run(&self, mut ctx: WasmContext, entry: &GuestEntry) -> (WasmContext, HostResult<()>) {
        let outcome = match entry {
            GuestEntry::OnLoad => self.declare_exports(&mut ctx),
            GuestEntry::Call { name, .. } => self.invoke(&mut ctx, name),
        };
        let outcome = outcome.map_err(|err| ctx.record_error(err));
        (ctx, outcome)
    }
}

// =============================================================================
// Processor
// =============================================================================

pub struct WasmProcessor {
    vm: Box<dyn WasmVm>,
    exports: RwLock<Vec<String>>,
    lock: Arc<InstanceLock>,
    config: Arc<HostConfig>,
}

impl WasmProcessor {
    pub fn new(vm: Box<dyn WasmVm>, config: Arc<HostConfig>) -> Self {
        Self {
            vm,
            exports: RwLock::new(Vec::new()),
            lock: Arc::new(InstanceLock::new()),
            config,
        }
    }

    /// Compile a WASM (or WAT) module and load it.
    pub fn from_wasm(bytes: &[u8], config: Arc<HostConfig>) -> HostResult<Self> {
        let vm = WasmtimeVm::new(bytes, &config)?;
        let processor = Self::new(Box::new(vm), config);
        processor.load()?;
        Ok(processor)
    }

    /// Load a Rust-hosted guest.
    pub fn hosted(guest: HostedGuest, config: Arc<HostConfig>) -> HostResult<Self> {
        let processor = Self::new(Box::new(guest), config);
        processor.load()?;
        Ok(processor)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn instance_lock(&self) -> &Arc<InstanceLock> {
        &self.lock
    }

    /// Run the guest's load phase and record the functions it declares.
    pub fn load(&self) -> HostResult<Vec<String>> {
        let mut ctx = WasmContext::new(Arc::clone(&self.lock), &self.config);
        let span = info_span!("wasm_load", call_id = ctx.call_id(), trace_id = %ctx.trace_id());
        let _enter = span.enter();

        ctx.begin()?;
        let (ctx, outcome) = {
            let _guard = self.lock.lock();
            self.vm.run(ctx, &GuestEntry::OnLoad)
        };
        let exports = ctx.exports();
        ctx.finalize(outcome)?;
        let exports = exports?;
        *self.exports.write() = exports.clone();
        Ok(exports)
    }

    pub fn exports(&self) -> Vec<String> {
        self.exports.read().clone()
    }

    /// Exported function whose name hashes to `hname`.
    pub fn function_name(&self, hname: ScHname) -> Option<String> {
        self.exports
            .read()
            .iter()
            .find(|name| hname_from_name(name) == hname)
            .cloned()
    }

    fn entry_for(&self, function: &str) -> HostResult<GuestEntry> {
        let exports = self.exports.read();
        if exports.is_empty() {
            return Ok(GuestEntry::Call {
                name: function.to_string(),
                index: None,
            });
        }
        let index = exports
            .iter()
            .position(|name| name == function)
            .ok_or_else(|| HostError::domain(format!("contract has no function {function}")))?;
        let index = u32::try_from(index).map_err(|_| HostError::internal("export index overflow"))?;
        Ok(GuestEntry::Call {
            name: function.to_string(),
            index: Some(index),
        })
    }

    /// Run `function` bound to `sandbox`. View calls that pass a baseline
    /// read state optimistically and fail with `StateInvalidated` if the
    /// chain moved underneath them.
    pub fn call(
        &self,
        function: &str,
        sandbox: SandboxHandle,
        baseline: Option<StateBaseline>,
    ) -> HostResult<Dict> {
        let entry = self.entry_for(function)?;
        let mut ctx = WasmContext::new(Arc::clone(&self.lock), &self.config);
        let span = info_span!(
            "wasm_call",
            call_id = ctx.call_id(),
            trace_id = %ctx.trace_id(),
            function,
            view = sandbox.is_view()
        );
        let _enter = span.enter();

        ctx.bind(sandbox, baseline)?;
        ctx.begin()?;
        // Engines record panics of host code on the context themselves; one
        // escaping the engine loses the context with it.
        let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.lock.lock();
            self.vm.run(ctx, &entry)
        }));
        match run {
            Ok((ctx, outcome)) => ctx.finalize(outcome),
            Err(payload) => {
                let err = HostError::from_panic(payload);
                warn!(function, error = %err, "engine panicked");
                Err(err)
            }
        }
    }

    pub fn call_full(&self, function: &str, sandbox: Arc<dyn Sandbox>) -> HostResult<Dict> {
        self.call(function, SandboxHandle::Full(sandbox), None)
    }

    pub fn call_view(
        &self,
        function: &str,
        sandbox: Arc<dyn SandboxView>,
        baseline: Option<StateBaseline>,
    ) -> HostResult<Dict> {
        self.call(function, SandboxHandle::View(sandbox), baseline)
    }
}
