//! Command-line driver for the WASM contract host.
//!
//! The host itself lives in `wasmhost-core`; this package adds what a tool
//! around it needs:
//!
//! - [`runner`]: deploy a contract on a local chain and run one function
//! - [`retry`]: bounded re-execution of invalidated view calls
//! - [`state_file`]: JSON persistence of contract state between runs
//! - [`logging`]: `tracing` subscriber setup

pub mod logging;
pub mod retry;
pub mod runner;
pub mod state_file;
