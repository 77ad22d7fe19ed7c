//! Capability handles onto the chain.
//!
//! A call is bound to exactly one handle. [`Sandbox`] can mutate state and
//! move value; [`SandboxView`] can only read and make further view calls.
//! Both are implemented outside this crate (the reference
//! [`LocalChain`](crate::local::LocalChain) is one implementation) and speak
//! `anyhow` at their boundary.

use std::sync::Arc;

use wasmhost_types::{
    Balances, ScAddress, ScAgentId, ScChainId, ScColor, ScHash, ScHname, ScRequestId,
};

use crate::error::{HostError, HostResult};
use crate::kv::{Dict, KvStore};

/// Request metadata attached to a `post`.
#[derive(Debug, Clone, PartialEq)]
pub struct SendMetadata {
    pub target_contract: ScHname,
    pub entry_point: ScHname,
    pub args: Dict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Unix seconds before which the request must not run.
    pub time_lock: Option<u32>,
}

/// Queries available to both full and view calls.
pub trait SandboxBase: Send + Sync {
    fn account_id(&self) -> ScAgentId;
    fn balances(&self) -> Balances;
    fn balance(&self, color: &ScColor) -> u64 {
        self.balances().balance(color)
    }
    fn chain_id(&self) -> ScChainId;
    fn chain_owner_id(&self) -> ScAgentId;
    fn contract(&self) -> ScHname;
    fn contract_creator(&self) -> ScAgentId;
    fn params(&self) -> Arc<Dict>;
    /// The contract's own partition of chain state.
    fn state(&self) -> Arc<dyn KvStore>;
    /// Nanoseconds since the Unix epoch.
    fn timestamp(&self) -> i64;
    fn log(&self, msg: &str);
}

/// Handle for a state-mutating call.
pub trait Sandbox: SandboxBase {
    fn caller(&self) -> ScAgentId;
    fn request_id(&self) -> ScRequestId;
    fn entropy(&self) -> ScHash;
    fn incoming_transfer(&self) -> Balances;
    fn minted(&self) -> Balances;
    fn call(
        &self,
        contract: ScHname,
        function: ScHname,
        params: Dict,
        transfer: Balances,
    ) -> anyhow::Result<Dict>;
    fn deploy_contract(
        &self,
        program_hash: &ScHash,
        name: &str,
        description: &str,
        init_params: Dict,
    ) -> anyhow::Result<()>;
    fn send(
        &self,
        target: &ScAddress,
        transfer: &Balances,
        metadata: Option<SendMetadata>,
        options: SendOptions,
    ) -> anyhow::Result<()>;
    fn event(&self, msg: &str);
}

/// Handle for a read-only call.
pub trait SandboxView: SandboxBase {
    fn call_view(&self, contract: ScHname, function: ScHname, params: Dict) -> anyhow::Result<Dict>;
}

/// Exactly one capability handle.
#[derive(Clone)]
pub enum SandboxHandle {
    Full(Arc<dyn Sandbox>),
    View(Arc<dyn SandboxView>),
}

macro_rules! forward {
    ($self:ident, $s:ident => $body:expr) => {
        match $self {
            SandboxHandle::Full($s) => $body,
            SandboxHandle::View($s) => $body,
        }
    };
}

impl SandboxHandle {
    pub fn is_view(&self) -> bool {
        matches!(self, SandboxHandle::View(_))
    }

    /// The mutation-capable handle, or a capability error on a view call.
    pub fn full(&self) -> HostResult<&dyn Sandbox> {
        match self {
            SandboxHandle::Full(sandbox) => Ok(sandbox.as_ref()),
            SandboxHandle::View(_) => Err(HostError::capability(
                "operation requires a full call, this is a view call",
            )),
        }
    }

    pub fn account_id(&self) -> ScAgentId {
        forward!(self, s => s.account_id())
    }

    pub fn balances(&self) -> Balances {
        forward!(self, s => s.balances())
    }

    pub fn balance(&self, color: &ScColor) -> u64 {
        forward!(self, s => s.balance(color))
    }

    pub fn chain_id(&self) -> ScChainId {
        forward!(self, s => s.chain_id())
    }

    pub fn chain_owner_id(&self) -> ScAgentId {
        forward!(self, s => s.chain_owner_id())
    }

    pub fn contract(&self) -> ScHname {
        forward!(self, s => s.contract())
    }

    pub fn contract_creator(&self) -> ScAgentId {
        forward!(self, s => s.contract_creator())
    }

    pub fn params(&self) -> Arc<Dict> {
        forward!(self, s => s.params())
    }

    pub fn state(&self) -> Arc<dyn KvStore> {
        forward!(self, s => s.state())
    }

    pub fn timestamp(&self) -> i64 {
        forward!(self, s => s.timestamp())
    }

    pub fn log(&self, msg: &str) {
        forward!(self, s => s.log(msg))
    }

    /// Nested call; a view handle only makes view calls and carries no value.
    pub fn call(
        &self,
        contract: ScHname,
        function: ScHname,
        params: Dict,
        transfer: Balances,
    ) -> HostResult<Dict> {
        match self {
            SandboxHandle::Full(sandbox) => sandbox
                .call(contract, function, params, transfer)
                .map_err(HostError::from_sandbox),
            SandboxHandle::View(_) if !transfer.is_empty() => Err(HostError::capability(
                "a view call cannot transfer value",
            )),
            SandboxHandle::View(view) => view
                .call_view(contract, function, params)
                .map_err(HostError::from_sandbox),
        }
    }
}
