//! Shared types for the wasmhost workspace.
//!
//! This crate holds everything that crosses the host/guest boundary as plain
//! integers or bytes, so the host core and any tooling agree on one wire shape.
//!
//! ## Modules
//!
//! - [`keys`] - the predefined (negative) key table
//! - [`type_tag`] - value kinds and their wire integers
//! - [`ids`] - fixed-size chain identifiers
//! - [`balances`] - color balances and their blob format
//! - [`codec`] - LEB128 / length-prefixed bytes encoder and decoder
//! - [`encoding`] - hex and base64 helpers for tooling

pub mod balances;
pub mod codec;
pub mod encoding;
pub mod ids;
pub mod keys;
pub mod type_tag;

pub use balances::Balances;
pub use codec::{BytesDecoder, BytesEncoder, CodecError};
pub use ids::{
    IdError, ScAddress, ScAgentId, ScChainId, ScColor, ScHash, ScHname, ScRequestId,
};
pub use keys::KeyId;
pub use type_tag::{TypeKind, TypeTag, TypeTagError};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a node in a call's object graph.
pub type ObjectId = i32;

/// The null object: reads return nothing, writes fail.
pub const OBJ_ID_NULL: ObjectId = 0;
/// The root context object, the only traversal entry point.
pub const OBJ_ID_ROOT: ObjectId = 1;

/// Configuration for retry behavior on invalidated view reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retry attempts.
    pub retries: usize,
    /// Initial backoff between retries, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Create a new RetryConfig with the specified parameters.
    pub fn new(retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            retries,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff before retry number `attempt` (0-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32) as u32).unwrap_or(u64::MAX);
        let millis = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_backoff_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 8,
            initial_backoff_ms: 25,
            max_backoff_ms: 1000,
        }
    }
}
