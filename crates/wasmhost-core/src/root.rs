//! The root context node (object 1).
//!
//! The root's shape is a static table: each predefined key maps to a type
//! and to one of three field kinds. Containers are built on first access,
//! getters read from the bound sandbox, setters forward to it.

use std::sync::Arc;

use tracing::{debug, info};
use wasmhost_types::keys::*;
use wasmhost_types::{Balances, KeyId, TypeKind, TypeTag};

use crate::container::{nested_index_key, nested_map_key, KvContainer};
use crate::error::{HostError, HostResult};
use crate::kv::{Dict, KvStore};
use crate::object::{HostEnv, HostObject, ObjectEffect};
use crate::sandbox::SandboxHandle;

/// Stores a call projects into the graph.
#[derive(Clone)]
pub struct CallStores {
    pub params: Arc<dyn KvStore>,
    /// Contract state; absent while the contract loads.
    pub state: Option<Arc<dyn KvStore>>,
    pub results: Arc<Dict>,
    /// Results of the most recent nested call.
    pub returned: Arc<Dict>,
    pub exports: Arc<Dict>,
}

impl Default for CallStores {
    fn default() -> Self {
        Self {
            params: Arc::new(Dict::new()),
            state: None,
            results: Arc::new(Dict::new()),
            returned: Arc::new(Dict::new()),
            exports: Arc::new(Dict::new()),
        }
    }
}

type Build = fn(&HostEnv<'_>) -> HostResult<Box<dyn HostObject>>;
type Get = fn(&HostEnv<'_>) -> HostResult<Vec<u8>>;
type Set = fn(&HostEnv<'_>, &str) -> HostResult<()>;

enum FieldKind {
    Container(Build),
    Getter(Get),
    Setter(Set),
}

struct RootField {
    key: KeyId,
    type_tag: TypeTag,
    kind: FieldKind,
}

const fn field(key: KeyId, kind: TypeKind, field_kind: FieldKind) -> RootField {
    RootField {
        key,
        type_tag: TypeTag::Value(kind),
        kind: field_kind,
    }
}

const fn array_field(key: KeyId, kind: TypeKind, build: Build) -> RootField {
    RootField {
        key,
        type_tag: TypeTag::Array(kind),
        kind: FieldKind::Container(build),
    }
}

static ROOT_FIELDS: [RootField; 23] = [
    field(KEY_ACCOUNT_ID, TypeKind::AgentId, FieldKind::Getter(get_account_id)),
    field(KEY_BALANCES, TypeKind::Map, FieldKind::Container(build_balances)),
    field(KEY_CALLER, TypeKind::AgentId, FieldKind::Getter(get_caller)),
    field(KEY_CHAIN_ID, TypeKind::ChainId, FieldKind::Getter(get_chain_id)),
    field(KEY_CHAIN_OWNER_ID, TypeKind::AgentId, FieldKind::Getter(get_chain_owner_id)),
    field(KEY_CONTRACT, TypeKind::Hname, FieldKind::Getter(get_contract)),
    field(KEY_CONTRACT_CREATOR, TypeKind::AgentId, FieldKind::Getter(get_contract_creator)),
    field(KEY_EVENT, TypeKind::String, FieldKind::Setter(set_event)),
    array_field(KEY_EXPORTS, TypeKind::String, build_exports),
    field(KEY_INCOMING, TypeKind::Map, FieldKind::Container(build_incoming)),
    field(KEY_LOG, TypeKind::String, FieldKind::Setter(set_log)),
    array_field(KEY_MAPS, TypeKind::Map, build_maps),
    field(KEY_MINTED, TypeKind::Map, FieldKind::Container(build_minted)),
    field(KEY_PANIC, TypeKind::String, FieldKind::Setter(set_panic)),
    field(KEY_PARAMS, TypeKind::Map, FieldKind::Container(build_params)),
    field(KEY_REQUEST_ID, TypeKind::RequestId, FieldKind::Getter(get_request_id)),
    field(KEY_RESULTS, TypeKind::Map, FieldKind::Container(build_results)),
    field(KEY_RETURN, TypeKind::Map, FieldKind::Container(build_return)),
    field(KEY_STATE, TypeKind::Map, FieldKind::Container(build_state)),
    field(KEY_TIMESTAMP, TypeKind::Int64, FieldKind::Getter(get_timestamp)),
    field(KEY_TRACE, TypeKind::String, FieldKind::Setter(set_trace)),
    array_field(KEY_TRANSFERS, TypeKind::Map, build_transfers),
    field(KEY_UTILITY, TypeKind::Map, FieldKind::Container(build_utility)),
];

fn lookup(key: KeyId) -> Option<&'static RootField> {
    ROOT_FIELDS.iter().find(|f| f.key == key)
}

fn key_name(key: KeyId) -> String {
    predefined_key(key).map_or_else(|| key.to_string(), str::to_string)
}

fn get_account_id(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.account_id().to_vec())
}

fn get_caller(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.full()?.caller().to_vec())
}

fn get_chain_id(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.chain_id().to_vec())
}

fn get_chain_owner_id(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.chain_owner_id().to_vec())
}

fn get_contract(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.contract().to_bytes().to_vec())
}

fn get_contract_creator(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.contract_creator().to_vec())
}

fn get_request_id(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.full()?.request_id().to_vec())
}

fn get_timestamp(env: &HostEnv<'_>) -> HostResult<Vec<u8>> {
    Ok(env.sandbox()?.timestamp().to_le_bytes().to_vec())
}

fn set_event(env: &HostEnv<'_>, msg: &str) -> HostResult<()> {
    env.sandbox()?.full()?.event(msg);
    Ok(())
}

fn set_log(env: &HostEnv<'_>, msg: &str) -> HostResult<()> {
    info!(target: "wasmhost::guest", "{msg}");
    if let Some(sandbox) = env.sandbox {
        sandbox.log(msg);
    }
    Ok(())
}

fn set_trace(_env: &HostEnv<'_>, msg: &str) -> HostResult<()> {
    debug!(target: "wasmhost::guest", "{msg}");
    Ok(())
}

fn set_panic(_env: &HostEnv<'_>, msg: &str) -> HostResult<()> {
    Err(HostError::domain(msg))
}

/// Scratch projection of a balance set: one `Int64` per color plus the
/// `$color` array listing the colors in order.
pub fn balances_dict(balances: &Balances) -> Dict {
    let dict = Dict::new();
    let colors = nested_map_key(b"", PREDEFINED_KEYS[(-KEY_COLOR - 1) as usize].as_bytes());
    let mut count = 0u32;
    for (color, amount) in balances.iter() {
        dict.insert(nested_map_key(b"", color.as_bytes()), amount.to_le_bytes().to_vec());
        dict.insert(nested_index_key(&colors, count), color.to_vec());
        count += 1;
    }
    dict.insert(colors, count.to_le_bytes().to_vec());
    dict
}

#[derive(Debug, Clone, Copy)]
enum BalanceSource {
    Account,
    Incoming,
    Minted,
}

/// Read-only balance projection that asks the sandbox on every read, so
/// value moved by `Send`, `Post` or `Call` shows up within the same call.
struct BalancesStore {
    sandbox: SandboxHandle,
    source: BalanceSource,
}

impl BalancesStore {
    fn current(&self) -> HostResult<Dict> {
        let balances = match self.source {
            BalanceSource::Account => self.sandbox.balances(),
            BalanceSource::Incoming => self.sandbox.full()?.incoming_transfer(),
            BalanceSource::Minted => self.sandbox.full()?.minted(),
        };
        Ok(balances_dict(&balances))
    }
}

impl KvStore for BalancesStore {
    fn get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>> {
        Ok(self.current()?.get_value(key))
    }

    fn set(&self, _key: &[u8], _value: &[u8]) -> HostResult<()> {
        Err(HostError::capability("balances are read-only"))
    }

    fn del(&self, _key: &[u8]) -> HostResult<()> {
        Err(HostError::capability("balances are read-only"))
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> HostResult<()> {
        self.current()?.iterate_prefix(prefix, f)
    }
}

fn balances_node(
    env: &HostEnv<'_>,
    label: &'static str,
    source: BalanceSource,
) -> HostResult<Box<dyn HostObject>> {
    let sandbox = env.sandbox()?;
    if !matches!(source, BalanceSource::Account) {
        sandbox.full()?;
    }
    let store = BalancesStore {
        sandbox: sandbox.clone(),
        source,
    };
    Ok(Box::new(KvContainer::map(label, Arc::new(store), false)))
}

fn build_balances(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    balances_node(env, "balances", BalanceSource::Account)
}

fn build_incoming(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    balances_node(env, "incoming", BalanceSource::Incoming)
}

fn build_minted(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    balances_node(env, "minted", BalanceSource::Minted)
}

fn build_params(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::map(
        "params",
        Arc::clone(&env.stores.params),
        false,
    )))
}

fn build_results(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::map(
        "results",
        env.stores.results.clone(),
        true,
    )))
}

fn build_return(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::map(
        "return",
        env.stores.returned.clone(),
        false,
    )))
}

fn build_state(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    let sandbox = env.sandbox()?;
    let state = env
        .stores
        .state
        .clone()
        .ok_or_else(|| HostError::internal("bound context without a state store"))?;
    let mutable = matches!(sandbox, SandboxHandle::Full(_));
    Ok(Box::new(KvContainer::map("state", state, mutable)))
}

fn build_exports(env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    if env.sandbox.is_some() {
        return Err(HostError::capability(
            "exports can only be declared while the contract loads",
        ));
    }
    Ok(Box::new(KvContainer::array(
        "exports",
        env.stores.exports.clone(),
        TypeKind::String,
        true,
    )))
}

fn build_maps(_env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::array(
        "maps",
        Arc::new(Dict::new()),
        TypeKind::Map,
        true,
    )))
}

fn build_transfers(_env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::array(
        "transfers",
        Arc::new(Dict::new()),
        TypeKind::Map,
        true,
    )))
}

fn build_utility(_env: &HostEnv<'_>) -> HostResult<Box<dyn HostObject>> {
    Ok(Box::new(KvContainer::map("utility", Arc::new(Dict::new()), true)))
}

/// Object 1.
#[derive(Debug, Default)]
pub struct ContextRoot;

impl ContextRoot {
    fn field(&self, key: KeyId) -> HostResult<&'static RootField> {
        lookup(key).ok_or_else(|| {
            HostError::protocol(format!("root context has no key {}", key_name(key)))
        })
    }
}

impl HostObject for ContextRoot {
    fn describe(&self) -> String {
        "root context".to_string()
    }

    fn declared_type(&self, key: KeyId) -> Option<TypeTag> {
        lookup(key).map(|f| f.type_tag)
    }

    fn exists(&self, env: &HostEnv<'_>, key: KeyId, _type_tag: TypeTag) -> HostResult<bool> {
        Ok(match lookup(key) {
            None => false,
            Some(_) if key == KEY_EXPORTS => env.sandbox.is_none(),
            Some(_) => true,
        })
    }

    fn get_bytes(
        &self,
        env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<Option<Vec<u8>>> {
        match self.field(key)?.kind {
            FieldKind::Getter(get) => get(env).map(Some),
            _ => Err(HostError::protocol(format!(
                "root key {} is not readable as bytes",
                key_name(key)
            ))),
        }
    }

    fn set_bytes(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
        value: &[u8],
    ) -> HostResult<ObjectEffect> {
        match self.field(key)?.kind {
            FieldKind::Setter(set) => {
                let msg = std::str::from_utf8(value)
                    .map_err(|_| HostError::protocol("root setter payload is not utf-8"))?;
                set(env, msg)?;
                Ok(ObjectEffect::None)
            }
            _ => Err(HostError::protocol(format!(
                "root key {} is not writable",
                key_name(key)
            ))),
        }
    }

    fn del_key(
        &mut self,
        _env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<ObjectEffect> {
        Err(HostError::protocol(format!(
            "root key {} cannot be deleted",
            key_name(key)
        )))
    }

    fn create_child(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<Box<dyn HostObject>> {
        match self.field(key)?.kind {
            FieldKind::Container(build) => build(env),
            _ => Err(HostError::protocol(format!(
                "root key {} is not a container",
                key_name(key)
            ))),
        }
    }
}

/// Predefined keys the root context answers, with their types.
pub fn root_shape() -> impl Iterator<Item = (KeyId, TypeTag)> {
    ROOT_FIELDS.iter().map(|f| (f.key, f.type_tag))
}
