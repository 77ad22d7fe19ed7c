//! Per-call host state.
//!
//! A [`WasmContext`] lives for exactly one guest invocation. It owns the key
//! registry and object graph for that call, the bound sandbox handle and the
//! call's scratch stores, and it is the only thing guest imports talk to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};
use uuid::Uuid;
use wasmhost_types::keys::{predefined_key, KEY_RETURN};
use wasmhost_types::{KeyId, ObjectId, TypeTag, OBJ_ID_ROOT};

use crate::baseline::{OptimisticReader, StateBaseline};
use crate::config::HostConfig;
use crate::container::nested_index_key;
use crate::dispatch;
use crate::error::{HostError, HostResult};
use crate::kv::{Dict, KvStore};
use crate::lock::InstanceLock;
use crate::object::{HostEnv, ObjectTable};
use crate::registry::KeyRegistry;
use crate::root::{CallStores, ContextRoot};
use crate::sandbox::SandboxHandle;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Graph holds the null and root objects; no sandbox yet.
    Created,
    /// A sandbox handle is attached.
    Bound,
    /// Guest code is executing.
    Running,
}

pub struct WasmContext {
    call_id: u64,
    trace_id: Uuid,
    state: ContextState,
    keys: KeyRegistry,
    objects: ObjectTable,
    sandbox: Option<SandboxHandle>,
    stores: CallStores,
    baseline: Option<StateBaseline>,
    instance_lock: Arc<InstanceLock>,
    trace_dispatch: bool,
    trace_all: bool,
    pending: Option<Vec<u8>>,
    error: Option<HostError>,
}

impl WasmContext {
    pub fn new(instance_lock: Arc<InstanceLock>, config: &HostConfig) -> Self {
        Self {
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            trace_id: Uuid::new_v4(),
            state: ContextState::Created,
            keys: KeyRegistry::new(),
            objects: ObjectTable::new(Box::new(ContextRoot)),
            sandbox: None,
            stores: CallStores::default(),
            baseline: None,
            instance_lock,
            trace_dispatch: config.traces_dispatch(),
            trace_all: config.traces_all(),
            pending: None,
            error: None,
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_view(&self) -> bool {
        self.sandbox.as_ref().is_some_and(SandboxHandle::is_view)
    }

    /// Attach the call's capability handle. View calls that pass a baseline
    /// read state through an [`OptimisticReader`].
    pub fn bind(
        &mut self,
        sandbox: SandboxHandle,
        baseline: Option<StateBaseline>,
    ) -> HostResult<()> {
        if self.state != ContextState::Created {
            return Err(HostError::internal(format!(
                "bind in state {:?}",
                self.state
            )));
        }
        let state = sandbox.state();
        self.stores.state = Some(match (&sandbox, &baseline) {
            (SandboxHandle::View(_), Some(baseline)) => {
                Arc::new(OptimisticReader::new(state, baseline.clone()))
            }
            _ => state,
        });
        self.stores.params = sandbox.params();
        self.sandbox = Some(sandbox);
        self.baseline = baseline;
        self.state = ContextState::Bound;
        Ok(())
    }

    /// Enter guest execution. An unbound context runs the load phase.
    pub fn begin(&mut self) -> HostResult<()> {
        if self.state == ContextState::Running {
            return Err(HostError::internal("context is already running"));
        }
        self.state = ContextState::Running;
        Ok(())
    }

    fn ensure_running(&self) -> HostResult<()> {
        if self.state == ContextState::Running {
            Ok(())
        } else {
            Err(HostError::protocol(format!(
                "guest access while context is {:?}",
                self.state
            )))
        }
    }

    /// Record `err` as the call's failure unless one is already recorded.
    pub fn record_error(&mut self, err: HostError) -> HostError {
        if self.error.is_none() {
            warn!(call_id = self.call_id, trace_id = %self.trace_id, error = %err, "call failed");
            self.error = Some(err.clone());
        }
        err
    }

    pub fn error(&self) -> Option<&HostError> {
        self.error.as_ref()
    }

    /// End the call and hand back its results. The first recorded error wins
    /// over whatever the engine reported; a view call whose baseline moved
    /// fails as invalidated.
    pub fn finalize(self, outcome: HostResult<()>) -> HostResult<Dict> {
        if let Some(err) = self.error {
            return Err(err);
        }
        outcome?;
        if let Some(baseline) = &self.baseline {
            baseline.check()?;
        }
        Ok(Dict::clone(&self.stores.results))
    }

    /// Function names the guest declared while loading.
    pub fn exports(&self) -> HostResult<Vec<String>> {
        let exports = &self.stores.exports;
        let len = match exports.get(b"")? {
            Some(raw) => u32::from_le_bytes(
                <[u8; 4]>::try_from(raw.as_slice())
                    .map_err(|_| HostError::internal("corrupt exports length"))?,
            ),
            None => 0,
        };
        (0..len)
            .map(|i| {
                let raw = exports
                    .get(&nested_index_key(b"", i))?
                    .ok_or_else(|| HostError::internal(format!("missing export {i}")))?;
                String::from_utf8(raw).map_err(|_| HostError::protocol("export name is not utf-8"))
            })
            .collect()
    }

    fn describe_key(&self, key: KeyId) -> String {
        match predefined_key(key) {
            Some(name) => name.to_string(),
            None => self
                .keys
                .resolve(key)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_else(|_| format!("#{key}")),
        }
    }

    fn trace_op(&self, op: &str, obj: ObjectId, key: KeyId, type_tag: TypeTag, detail: &str) {
        if self.trace_all {
            trace!(
                call_id = self.call_id,
                "{op} o{obj} k'{}' {type_tag} {detail}",
                self.describe_key(key)
            );
        }
    }

    pub fn exists(&mut self, obj: ObjectId, key: KeyId, type_id: i32) -> HostResult<bool> {
        self.ensure_running()?;
        let type_tag = TypeTag::from_i32(type_id)?;
        self.objects.check_type(obj, key, type_tag)?;
        let env = HostEnv::new(&self.keys, self.sandbox.as_ref(), &self.stores);
        let found = self.objects.find(obj)?.exists(&env, key, type_tag)?;
        self.trace_op("Exists", obj, key, type_tag, &format!("= {found}"));
        Ok(found)
    }

    pub fn get_bytes(
        &mut self,
        obj: ObjectId,
        key: KeyId,
        type_id: i32,
    ) -> HostResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        let type_tag = TypeTag::from_i32(type_id)?;
        self.objects.check_type(obj, key, type_tag)?;
        let env = HostEnv::new(&self.keys, self.sandbox.as_ref(), &self.stores);
        let value = self.objects.find(obj)?.get_bytes(&env, key, type_tag)?;
        self.trace_op(
            "GetBytes",
            obj,
            key,
            type_tag,
            &value.as_ref().map_or("absent".to_string(), |v| format!("{} bytes", v.len())),
        );
        Ok(value)
    }

    pub fn set_bytes(
        &mut self,
        obj: ObjectId,
        key: KeyId,
        type_id: i32,
        value: &[u8],
    ) -> HostResult<()> {
        self.ensure_running()?;
        let type_tag = TypeTag::from_i32(type_id)?;
        self.trace_op("SetBytes", obj, key, type_tag, &format!("{} bytes", value.len()));
        self.objects.check_type(obj, key, type_tag)?;
        let env = HostEnv::new(&self.keys, self.sandbox.as_ref(), &self.stores);
        let effect = self
            .objects
            .find_mut(obj)?
            .set_bytes(&env, key, type_tag, value)?;
        self.objects.apply(obj, effect)
    }

    pub fn del_key(&mut self, obj: ObjectId, key: KeyId, type_id: i32) -> HostResult<()> {
        self.ensure_running()?;
        let type_tag = TypeTag::from_i32(type_id)?;
        self.trace_op("DelKey", obj, key, type_tag, "");
        self.objects.check_type(obj, key, type_tag)?;
        let env = HostEnv::new(&self.keys, self.sandbox.as_ref(), &self.stores);
        let effect = self.objects.find_mut(obj)?.del_key(&env, key, type_tag)?;
        self.objects.apply(obj, effect)
    }

    pub fn get_object_id(&mut self, obj: ObjectId, key: KeyId, type_id: i32) -> HostResult<ObjectId> {
        self.ensure_running()?;
        let type_tag = TypeTag::from_i32(type_id)?;
        if !type_tag.is_container() {
            return Err(HostError::protocol(format!(
                "object id requested for scalar type {type_tag}"
            )));
        }
        let env = HostEnv::new(&self.keys, self.sandbox.as_ref(), &self.stores);
        let id = self
            .objects
            .get_or_create(obj, key, type_tag, |parent| {
                parent.create_child(&env, key, type_tag)
            })?;
        self.trace_op("GetObjectID", obj, key, type_tag, &format!("= o{id}"));
        Ok(id)
    }

    pub fn get_key_id_from_string(&mut self, key: &str) -> HostResult<KeyId> {
        self.ensure_running()?;
        self.keys.intern_str(key)
    }

    pub fn get_key_id_from_bytes(&mut self, key: &[u8]) -> HostResult<KeyId> {
        self.ensure_running()?;
        self.keys.intern_bytes(key)
    }

    /// Run sandbox function `fn_nr` and cache its result for retrieval.
    /// Returns the result length, or -1 when the function returns nothing.
    pub fn call_function(&mut self, fn_nr: i32, args: &[u8]) -> HostResult<i32> {
        self.ensure_running()?;
        let result = dispatch::dispatch(self, fn_nr, args)?;
        let len = match &result {
            Some(bytes) => i32::try_from(bytes.len())
                .map_err(|_| HostError::internal("function result too large"))?,
            None => -1,
        };
        self.pending = result;
        Ok(len)
    }

    /// Hand over the cached function result, clearing it.
    pub fn take_function_result(&mut self) -> Option<Vec<u8>> {
        self.pending.take()
    }

    pub(crate) fn trace_dispatch(&self) -> bool {
        self.trace_dispatch
    }

    pub(crate) fn sandbox(&self) -> HostResult<&SandboxHandle> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| HostError::capability("no sandbox is bound during contract load"))
    }

    pub(crate) fn instance_lock(&self) -> &InstanceLock {
        &self.instance_lock
    }

    pub fn results(&self) -> &Dict {
        &self.stores.results
    }

    pub(crate) fn replace_results(&mut self, results: &Dict) {
        self.stores.results.replace_with(results);
    }

    /// Expose a nested call's results as a fresh `Return` node.
    pub(crate) fn replace_return(&mut self, returned: Dict) -> HostResult<()> {
        self.stores.returned = Arc::new(returned);
        self.objects.detach(OBJ_ID_ROOT, KEY_RETURN)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmhost_types::keys::{KEY_EXPORTS, KEY_LENGTH, KEY_MAPS, KEY_RESULTS};
    use wasmhost_types::TypeKind;

    fn running() -> WasmContext {
        let mut ctx = WasmContext::new(Arc::new(InstanceLock::new()), &HostConfig::default());
        ctx.begin().unwrap();
        ctx
    }

    #[test]
    fn call_ids_are_never_reused() {
        let a = WasmContext::new(Arc::new(InstanceLock::new()), &HostConfig::default());
        let b = WasmContext::new(Arc::new(InstanceLock::new()), &HostConfig::default());
        assert!(b.call_id() > a.call_id());
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn guest_access_requires_running_state() {
        let mut ctx = WasmContext::new(Arc::new(InstanceLock::new()), &HostConfig::default());
        assert!(matches!(
            ctx.get_object_id(OBJ_ID_ROOT, KEY_MAPS, TypeTag::Array(TypeKind::Map).as_i32()),
            Err(HostError::Protocol(_))
        ));
        ctx.begin().unwrap();
        assert!(ctx.begin().is_err());
    }

    #[test]
    fn first_error_is_kept() {
        let mut ctx = running();
        ctx.record_error(HostError::domain("first"));
        ctx.record_error(HostError::domain("second"));
        assert_eq!(ctx.error(), Some(&HostError::domain("first")));
        assert_eq!(ctx.finalize(Ok(())).unwrap_err(), HostError::domain("first"));
    }

    #[test]
    fn load_phase_collects_exports() {
        let mut ctx = running();
        let exports = ctx
            .get_object_id(OBJ_ID_ROOT, KEY_EXPORTS, TypeTag::Array(TypeKind::String).as_i32())
            .unwrap();
        ctx.set_bytes(exports, 0, TypeTag::STRING.as_i32(), b"increment").unwrap();
        ctx.set_bytes(exports, 1, TypeTag::STRING.as_i32(), b"getCounter").unwrap();
        assert_eq!(ctx.exports().unwrap(), vec!["increment", "getCounter"]);
        assert_eq!(
            ctx.get_bytes(exports, KEY_LENGTH, TypeTag::INT32.as_i32()).unwrap(),
            Some(2u32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn results_written_by_the_guest_are_returned() {
        let mut ctx = running();
        let results = ctx
            .get_object_id(OBJ_ID_ROOT, KEY_RESULTS, TypeTag::MAP.as_i32())
            .unwrap();
        let key = ctx.get_key_id_from_string("answer").unwrap();
        ctx.set_bytes(results, key, TypeTag::INT64.as_i32(), &42i64.to_le_bytes())
            .unwrap();
        let out = ctx.finalize(Ok(())).unwrap();
        assert_eq!(out.get_value(b"answer"), Some(42i64.to_le_bytes().to_vec()));
    }

    #[test]
    fn unknown_type_ids_are_protocol_errors() {
        let mut ctx = running();
        assert!(matches!(
            ctx.get_bytes(OBJ_ID_ROOT, KEY_RESULTS, 99),
            Err(HostError::Protocol(_))
        ));
        assert!(matches!(
            ctx.get_object_id(OBJ_ID_ROOT, KEY_RESULTS, TypeTag::INT64.as_i32()),
            Err(HostError::Protocol(_))
        ));
    }
}
