//! Host side of the WASM contract sandbox.
//!
//! Guests talk to the host through five integer-only imports. Behind them
//! this crate keeps, per call, a key registry and a lazily built object graph
//! that projects chain state, call parameters and results as nested maps and
//! arrays, plus a table of numbered sandbox functions for everything else.
//!
//! ## Modules
//!
//! - [`registry`] - per-call key interning
//! - [`object`] - the object graph and the [`HostObject`](object::HostObject) seam
//! - [`container`] / [`kv`] - KV-backed map and array nodes
//! - [`root`] - the root context node
//! - [`sandbox`] - full and view capability handles
//! - [`dispatch`] / [`utility`] - the sandbox function table
//! - [`baseline`] - optimistic read consistency for view calls
//! - [`context`] - per-call state
//! - [`vm`] / [`wasmtime_vm`] - guest engines and the contract processor
//! - [`local`] - an in-memory reference chain

pub mod baseline;
pub mod config;
pub mod container;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod kv;
pub mod local;
pub mod lock;
pub mod object;
pub mod registry;
pub mod root;
pub mod sandbox;
pub mod utility;
pub mod vm;
pub mod wasmtime_vm;

pub use baseline::{GlobalStateIndex, OptimisticReader, StateBaseline};
pub use config::HostConfig;
pub use context::WasmContext;
pub use error::{HostError, HostResult};
pub use kv::{Dict, KvStore};
pub use local::LocalChain;
pub use sandbox::{Sandbox, SandboxBase, SandboxHandle, SandboxView, SendMetadata, SendOptions};
pub use vm::{HostedGuest, WasmProcessor, WasmVm};
