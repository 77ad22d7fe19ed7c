//! Host error taxonomy.
//!
//! Every failure inside a call unwinds to the context boundary as one
//! [`HostError`]. Collaborators (stores, sandboxes) speak `anyhow` and are
//! folded in through `From<anyhow::Error>`, which keeps a `HostError` that was
//! wrapped on the way out intact.

use thiserror::Error;
use wasmhost_types::{CodecError, IdError, KeyId, ObjectId, TypeTag, TypeTagError};

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The guest broke the ABI: unknown object, unknown function number,
    /// malformed buffer, key not valid for the node.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("type mismatch on object {object} key {key}: slot holds {declared}, accessed as {requested}")]
    TypeMismatch {
        object: ObjectId,
        key: KeyId,
        declared: TypeTag,
        requested: TypeTag,
    },

    /// A mutation was attempted through a handle that cannot mutate.
    #[error("capability violation: {0}")]
    Capability(String),

    /// Chain state moved under a view read; the whole call may be retried.
    #[error("state invalidated during read")]
    StateInvalidated,

    #[error("{0}")]
    Domain(String),

    #[error("internal consistency error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("guest error: {0}")]
    Guest(String),
}

impl HostError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        HostError::Protocol(msg.into())
    }

    pub fn capability(msg: impl Into<String>) -> Self {
        HostError::Capability(msg.into())
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        HostError::Domain(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HostError::Internal(msg.into())
    }

    /// Fold a sandbox failure in; anything that is not already a host
    /// error is a domain failure of the requested operation.
    pub fn from_sandbox(err: anyhow::Error) -> Self {
        match err.downcast::<HostError>() {
            Ok(host) => host,
            Err(other) => HostError::Domain(format!("{other:#}")),
        }
    }

    /// A panic caught at the call boundary.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        HostError::Internal(format!("panicked: {msg}"))
    }

    /// Run `f`, turning a panic into an internal error.
    pub fn catch<T>(f: impl FnOnce() -> HostResult<T>) -> HostResult<T> {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            Err(HostError::from_panic(payload))
        })
    }

    /// Only an invalidated view read is worth running again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::StateInvalidated)
    }
}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<HostError>() {
            Ok(host) => host,
            Err(other) => HostError::Store(format!("{other:#}")),
        }
    }
}

impl From<CodecError> for HostError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Id(id) => HostError::from(id),
            other => HostError::Protocol(other.to_string()),
        }
    }
}

impl From<IdError> for HostError {
    fn from(err: IdError) -> Self {
        HostError::Domain(err.to_string())
    }
}

impl From<TypeTagError> for HostError {
    fn from(err: TypeTagError) -> Self {
        HostError::Protocol(err.to_string())
    }
}
