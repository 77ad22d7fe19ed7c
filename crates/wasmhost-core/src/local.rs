//! # LocalChain: in-memory reference chain
//!
//! Implements both capability traits over plain in-memory state so contracts
//! can be deployed, called and viewed without a ledger or consensus. Used by
//! the integration tests and the `wasmhost` CLI.
//!
//! A top-level request is atomic: contract state, account balances, emitted
//! events and sent requests are snapshotted before it runs and restored if
//! it fails. Requests run one at a time. The global state index is invalid
//! while a request runs and moves on when it commits, so a concurrent view
//! call never passes its baseline on state that may still be rolled back.
//!
//! A guest must not post a new top-level request on the same chain from
//! inside a request; nested work goes through the sandbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use wasmhost_types::{
    Balances, ScAddress, ScAgentId, ScChainId, ScColor, ScHash, ScHname, ScRequestId,
};

use crate::baseline::GlobalStateIndex;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::kv::{Dict, KvStore};
use crate::sandbox::{Sandbox, SandboxBase, SandboxView, SendMetadata, SendOptions};
use crate::utility::{blake2b, hname_from_name, ADDRESS_ED25519};
use crate::vm::{HostedGuest, WasmProcessor};

/// Name of the optional function run once right after deployment.
pub const INIT_FUNCTION: &str = "init";

/// Kind byte of chain (alias) addresses.
const ADDRESS_ALIAS: u8 = 2;

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A value transfer recorded by `send` or `post`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub sender: ScAgentId,
    pub target: ScAddress,
    pub transfer: Balances,
    pub metadata: Option<SendMetadata>,
    pub options: SendOptions,
}

struct Contract {
    name: String,
    creator: ScAgentId,
    processor: Arc<WasmProcessor>,
    state: Arc<Dict>,
}

#[derive(Debug, Clone, Copy)]
struct RequestInfo {
    id: ScRequestId,
    timestamp: i64,
}

struct Snapshot {
    states: HashMap<ScHname, BTreeMap<Vec<u8>, Vec<u8>>>,
    accounts: HashMap<ScAgentId, Balances>,
    events: usize,
    sent: usize,
}

struct ChainInner {
    chain_id: ScChainId,
    owner: ScAgentId,
    config: Arc<HostConfig>,
    global: Arc<GlobalStateIndex>,
    contracts: RwLock<BTreeMap<ScHname, Arc<Contract>>>,
    programs: RwLock<HashMap<ScHash, Vec<u8>>>,
    accounts: Mutex<HashMap<ScAgentId, Balances>>,
    events: Mutex<Vec<String>>,
    logs: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentRequest>>,
    requests: AtomicU64,
    /// Held from snapshot to commit or rollback of a top-level request.
    serial: Mutex<()>,
}

impl ChainInner {
    fn agent_id(&self, contract: ScHname) -> ScAgentId {
        ScAgentId::from_parts(&self.chain_id.address(), contract)
    }

    fn contract(&self, hname: ScHname) -> HostResult<Arc<Contract>> {
        self.contracts
            .read()
            .get(&hname)
            .cloned()
            .ok_or_else(|| HostError::domain(format!("unknown contract {hname}")))
    }

    fn next_request(&self) -> RequestInfo {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        let tx = sha256(&[self.chain_id.as_bytes(), &n.to_le_bytes()]);
        RequestInfo {
            id: ScRequestId::from_parts(&ScHash::new(tx), 0),
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }

    fn balances(&self, agent: &ScAgentId) -> Balances {
        self.accounts.lock().get(agent).cloned().unwrap_or_default()
    }

    fn credit(&self, agent: ScAgentId, amounts: &Balances) {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(agent).or_default();
        for (color, amount) in amounts.iter() {
            account.add(*color, *amount);
        }
    }

    fn debit(&self, agent: ScAgentId, amounts: &Balances) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(agent).or_default();
        if !account.covers(amounts) {
            bail!("insufficient balance in {agent} for transfer of {} tokens", amounts.total());
        }
        for (color, amount) in amounts.iter() {
            account.sub(*color, *amount);
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            states: self
                .contracts
                .read()
                .iter()
                .map(|(hname, c)| (*hname, c.state.entries()))
                .collect(),
            accounts: self.accounts.lock().clone(),
            events: self.events.lock().len(),
            sent: self.sent.lock().len(),
        }
    }

    fn restore(&self, snapshot: Snapshot) {
        let mut contracts = self.contracts.write();
        contracts.retain(|hname, _| snapshot.states.contains_key(hname));
        for (hname, entries) in snapshot.states {
            if let Some(contract) = contracts.get(&hname) {
                contract.state.replace_with(&Dict::from(entries));
            }
        }
        *self.accounts.lock() = snapshot.accounts;
        self.events.lock().truncate(snapshot.events);
        self.sent.lock().truncate(snapshot.sent);
    }

    /// Run `function` of `contract` as a full call. The transfer is credited
    /// to the contract before the guest runs.
    fn invoke(
        self: &Arc<Self>,
        contract: ScHname,
        function: &str,
        params: Dict,
        caller: ScAgentId,
        transfer: Balances,
        request: RequestInfo,
    ) -> HostResult<Dict> {
        let target = self.contract(contract)?;
        self.credit(self.agent_id(contract), &transfer);
        debug!(contract = %target.name, function, "full call");
        let sandbox = LocalSandbox {
            chain: Arc::clone(self),
            contract,
            creator: target.creator,
            state: Arc::clone(&target.state),
            params: Arc::new(params),
            caller,
            transfer,
            request,
        };
        target.processor.call_full(function, Arc::new(sandbox))
    }

    fn invoke_view(
        self: &Arc<Self>,
        contract: ScHname,
        function: &str,
        params: Dict,
        request: RequestInfo,
    ) -> HostResult<Dict> {
        let target = self.contract(contract)?;
        debug!(contract = %target.name, function, "view call");
        let sandbox = LocalSandbox {
            chain: Arc::clone(self),
            contract,
            creator: target.creator,
            state: Arc::clone(&target.state),
            params: Arc::new(params),
            caller: ScAgentId::default(),
            transfer: Balances::new(),
            request,
        };
        target
            .processor
            .call_view(function, Arc::new(sandbox), Some(self.global.baseline()))
    }

    /// Register a loaded processor and run its `init` if it has one.
    fn install(
        self: &Arc<Self>,
        name: &str,
        processor: WasmProcessor,
        creator: ScAgentId,
        init_params: Dict,
        request: RequestInfo,
    ) -> HostResult<ScHname> {
        let hname = hname_from_name(name);
        let has_init = processor.exports().iter().any(|f| f == INIT_FUNCTION);
        {
            let mut contracts = self.contracts.write();
            if contracts.contains_key(&hname) {
                return Err(HostError::domain(format!("contract {name} already exists")));
            }
            contracts.insert(
                hname,
                Arc::new(Contract {
                    name: name.to_string(),
                    creator,
                    processor: Arc::new(processor),
                    state: Arc::new(Dict::new()),
                }),
            );
        }
        info!(contract = name, %hname, "deployed contract");
        if has_init {
            self.invoke(hname, INIT_FUNCTION, init_params, creator, Balances::new(), request)?;
        }
        Ok(hname)
    }

    fn deploy_program(
        self: &Arc<Self>,
        program_hash: &ScHash,
        name: &str,
        init_params: Dict,
        creator: ScAgentId,
        request: RequestInfo,
    ) -> HostResult<ScHname> {
        let program = self
            .programs
            .read()
            .get(program_hash)
            .cloned()
            .ok_or_else(|| HostError::domain(format!("unknown program {program_hash}")))?;
        let processor = WasmProcessor::from_wasm(&program, Arc::clone(&self.config))?;
        self.install(name, processor, creator, init_params, request)
    }

    /// Run `op` as one atomic request.
    fn atomically<T>(&self, op: impl FnOnce() -> HostResult<T>) -> HostResult<T> {
        let _serial = self.serial.lock();
        let index = self.global.begin_transition();
        let snapshot = self.snapshot();
        let result = HostError::catch(op);
        if let Err(err) = &result {
            debug!(error = %err, "rolling back request");
            self.restore(snapshot);
        }
        self.global.end_transition(index, result.is_ok());
        result
    }
}

/// Handle passed to one contract invocation.
struct LocalSandbox {
    chain: Arc<ChainInner>,
    contract: ScHname,
    creator: ScAgentId,
    state: Arc<Dict>,
    params: Arc<Dict>,
    caller: ScAgentId,
    transfer: Balances,
    request: RequestInfo,
}

impl LocalSandbox {
    fn me(&self) -> ScAgentId {
        self.chain.agent_id(self.contract)
    }

    fn function_name(&self, contract: ScHname, function: ScHname) -> anyhow::Result<String> {
        self.chain
            .contract(contract)?
            .processor
            .function_name(function)
            .ok_or_else(|| anyhow!("contract {contract} has no function {function}"))
    }
}

impl SandboxBase for LocalSandbox {
    fn account_id(&self) -> ScAgentId {
        self.me()
    }

    fn balances(&self) -> Balances {
        self.chain.balances(&self.me())
    }

    fn chain_id(&self) -> ScChainId {
        self.chain.chain_id
    }

    fn chain_owner_id(&self) -> ScAgentId {
        self.chain.owner
    }

    fn contract(&self) -> ScHname {
        self.contract
    }

    fn contract_creator(&self) -> ScAgentId {
        self.creator
    }

    fn params(&self) -> Arc<Dict> {
        Arc::clone(&self.params)
    }

    fn state(&self) -> Arc<dyn KvStore> {
        self.state.clone()
    }

    fn timestamp(&self) -> i64 {
        self.request.timestamp
    }

    fn log(&self, msg: &str) {
        self.chain.logs.lock().push(format!("{}: {msg}", self.contract));
    }
}

impl Sandbox for LocalSandbox {
    fn caller(&self) -> ScAgentId {
        self.caller
    }

    fn request_id(&self) -> ScRequestId {
        self.request.id
    }

    fn entropy(&self) -> ScHash {
        ScHash::new(sha256(&[self.request.id.as_bytes(), &self.contract.to_bytes()]))
    }

    fn incoming_transfer(&self) -> Balances {
        self.transfer.clone()
    }

    fn minted(&self) -> Balances {
        Balances::new().with(ScColor::MINT, self.transfer.balance(&ScColor::MINT))
    }

    fn call(
        &self,
        contract: ScHname,
        function: ScHname,
        params: Dict,
        transfer: Balances,
    ) -> anyhow::Result<Dict> {
        let name = self.function_name(contract, function)?;
        self.chain.debit(self.me(), &transfer)?;
        Ok(self
            .chain
            .invoke(contract, &name, params, self.me(), transfer, self.request)?)
    }

    fn deploy_contract(
        &self,
        program_hash: &ScHash,
        name: &str,
        _description: &str,
        init_params: Dict,
    ) -> anyhow::Result<()> {
        self.chain
            .deploy_program(program_hash, name, init_params, self.me(), self.request)?;
        Ok(())
    }

    fn send(
        &self,
        target: &ScAddress,
        transfer: &Balances,
        metadata: Option<SendMetadata>,
        options: SendOptions,
    ) -> anyhow::Result<()> {
        self.chain.debit(self.me(), transfer)?;
        self.chain.sent.lock().push(SentRequest {
            sender: self.me(),
            target: *target,
            transfer: transfer.clone(),
            metadata,
            options,
        });
        Ok(())
    }

    fn event(&self, msg: &str) {
        info!(target: "wasmhost::event", contract = %self.contract, "{msg}");
        self.chain.events.lock().push(msg.to_string());
    }
}

impl SandboxView for LocalSandbox {
    fn call_view(&self, contract: ScHname, function: ScHname, params: Dict) -> anyhow::Result<Dict> {
        let name = self.function_name(contract, function)?;
        Ok(self.chain.invoke_view(contract, &name, params, self.request)?)
    }
}

/// In-memory chain hosting any number of contracts.
#[derive(Clone)]
pub struct LocalChain {
    inner: Arc<ChainInner>,
}

impl LocalChain {
    pub fn new(config: HostConfig) -> Self {
        let mut chain_id = [0u8; ScChainId::LENGTH];
        chain_id[0] = ADDRESS_ALIAS;
        chain_id[1..].copy_from_slice(&sha256(&[b"wasmhost local chain"]));
        let owner_key = sha256(&[b"wasmhost local owner"]);
        let owner = ScAgentId::from_parts(
            &ScAddress::from_parts(ADDRESS_ED25519, &owner_key),
            ScHname(0),
        );
        Self {
            inner: Arc::new(ChainInner {
                chain_id: ScChainId::new(chain_id),
                owner,
                config: Arc::new(config),
                global: Arc::new(GlobalStateIndex::default()),
                contracts: RwLock::new(BTreeMap::new()),
                programs: RwLock::new(HashMap::new()),
                accounts: Mutex::new(HashMap::new()),
                events: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                requests: AtomicU64::new(0),
                serial: Mutex::new(()),
            }),
        }
    }

    pub fn chain_id(&self) -> ScChainId {
        self.inner.chain_id
    }

    pub fn owner(&self) -> ScAgentId {
        self.inner.owner
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.inner.config
    }

    pub fn global_state(&self) -> Arc<GlobalStateIndex> {
        Arc::clone(&self.inner.global)
    }

    /// Agent id of a contract on this chain.
    pub fn agent_id(&self, contract: ScHname) -> ScAgentId {
        self.inner.agent_id(contract)
    }

    /// Store a program blob for later deployment by hash.
    pub fn store_program(&self, program: Vec<u8>) -> ScHash {
        let hash = blake2b(&program);
        self.inner.programs.write().insert(hash, program);
        hash
    }

    pub fn deploy_wasm(&self, name: &str, program: &[u8], init_params: Dict) -> HostResult<ScHname> {
        let processor = WasmProcessor::from_wasm(program, Arc::clone(&self.inner.config))?;
        self.deploy_processor(name, processor, init_params)
    }

    pub fn deploy_hosted(
        &self,
        name: &str,
        guest: HostedGuest,
        init_params: Dict,
    ) -> HostResult<ScHname> {
        let processor = WasmProcessor::hosted(guest, Arc::clone(&self.inner.config))?;
        self.deploy_processor(name, processor, init_params)
    }

    fn deploy_processor(
        &self,
        name: &str,
        processor: WasmProcessor,
        init_params: Dict,
    ) -> HostResult<ScHname> {
        let request = self.inner.next_request();
        let owner = self.inner.owner;
        self.inner
            .atomically(|| self.inner.install(name, processor, owner, init_params, request))
    }

    /// Run `function` of `contract` as one atomic full request.
    pub fn post_request(
        &self,
        contract: ScHname,
        function: &str,
        params: Dict,
        caller: ScAgentId,
        transfer: Balances,
    ) -> HostResult<Dict> {
        let request = self.inner.next_request();
        self.inner.atomically(|| {
            self.inner
                .invoke(contract, function, params, caller, transfer, request)
        })
    }

    /// Run `function` of `contract` as a view call against a fresh baseline.
    pub fn call_view(&self, contract: ScHname, function: &str, params: Dict) -> HostResult<Dict> {
        let request = self.inner.next_request();
        self.inner.invoke_view(contract, function, params, request)
    }

    /// The live state of a contract.
    pub fn state(&self, contract: ScHname) -> HostResult<Arc<Dict>> {
        Ok(Arc::clone(&self.inner.contract(contract)?.state))
    }

    pub fn contracts(&self) -> Vec<(ScHname, String)> {
        self.inner
            .contracts
            .read()
            .iter()
            .map(|(hname, c)| (*hname, c.name.clone()))
            .collect()
    }

    pub fn balances(&self, agent: &ScAgentId) -> Balances {
        self.inner.balances(agent)
    }

    pub fn credit(&self, agent: ScAgentId, amounts: &Balances) {
        self.inner.credit(agent, amounts);
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.events.lock().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.logs.lock().clone()
    }

    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.inner.sent.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WasmContext;
    use wasmhost_types::keys::{KEY_EVENT, KEY_STATE};
    use wasmhost_types::{TypeTag, OBJ_ID_ROOT};

    fn write_flag(ctx: &mut WasmContext) -> HostResult<()> {
        let state = ctx.get_object_id(OBJ_ID_ROOT, KEY_STATE, TypeTag::MAP.as_i32())?;
        let key = ctx.get_key_id_from_string("flag")?;
        ctx.set_bytes(state, key, TypeTag::BYTES.as_i32(), b"set")
    }

    fn write_then_fail(ctx: &mut WasmContext) -> HostResult<()> {
        write_flag(ctx)?;
        ctx.set_bytes(OBJ_ID_ROOT, KEY_EVENT, TypeTag::STRING.as_i32(), b"about to fail")?;
        Err(HostError::domain("boom"))
    }

    fn chain_with_flagger() -> (LocalChain, ScHname) {
        let chain = LocalChain::new(HostConfig::default());
        let guest = HostedGuest::new()
            .with_function("set", write_flag)
            .with_function("fail", write_then_fail);
        let hname = chain.deploy_hosted("flagger", guest, Dict::new()).unwrap();
        (chain, hname)
    }

    #[test]
    fn successful_requests_commit_and_advance_the_index() {
        let (chain, hname) = chain_with_flagger();
        let before = chain.global_state().get();
        chain
            .post_request(hname, "set", Dict::new(), chain.owner(), Balances::new())
            .unwrap();
        assert_eq!(chain.state(hname).unwrap().get_value(b"flag"), Some(b"set".to_vec()));
        assert_eq!(chain.global_state().get(), before + 1);
    }

    #[test]
    fn failed_requests_roll_back() {
        let (chain, hname) = chain_with_flagger();
        let before = chain.global_state().get();
        let err = chain
            .post_request(hname, "fail", Dict::new(), chain.owner(), Balances::new())
            .unwrap_err();
        assert_eq!(err, HostError::domain("boom"));
        assert!(chain.state(hname).unwrap().is_empty());
        assert!(chain.events().is_empty());
        assert_eq!(chain.global_state().get(), before);
    }

    #[test]
    fn index_is_invalid_while_a_request_runs() {
        let chain = LocalChain::new(HostConfig::default());
        let global = chain.global_state();
        let guest = HostedGuest::new().with_function("look", move |_| {
            assert!(global.is_invalid());
            Ok(())
        });
        let hname = chain.deploy_hosted("looker", guest, Dict::new()).unwrap();
        let before = chain.global_state().get();
        chain
            .post_request(hname, "look", Dict::new(), chain.owner(), Balances::new())
            .unwrap();
        assert_eq!(chain.global_state().get(), before + 1);
    }

    #[test]
    fn deploying_twice_is_rejected() {
        let (chain, _) = chain_with_flagger();
        let err = chain
            .deploy_hosted("flagger", HostedGuest::new(), Dict::new())
            .unwrap_err();
        assert!(matches!(err, HostError::Domain(_)));
        assert_eq!(chain.contracts().len(), 1);
    }

    #[test]
    fn debits_require_cover() {
        let chain = LocalChain::new(HostConfig::default());
        let agent = chain.owner();
        chain.credit(agent, &Balances::new().with(ScColor::IOTA, 10));
        assert!(chain
            .inner
            .debit(agent, &Balances::new().with(ScColor::IOTA, 11))
            .is_err());
        chain
            .inner
            .debit(agent, &Balances::new().with(ScColor::IOTA, 4))
            .unwrap();
        assert_eq!(chain.balances(&agent).balance(&ScColor::IOTA), 6);
    }
}
