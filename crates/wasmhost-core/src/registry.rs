//! Per-call key interning.

use std::collections::HashMap;

use wasmhost_types::keys::{predefined_key, predefined_key_id};
use wasmhost_types::KeyId;

use crate::error::{HostError, HostResult};

/// Bijection between key bytes and [`KeyId`]s for one call.
///
/// Predefined keys resolve to their fixed negative IDs without touching the
/// registry; everything else gets the next non-negative ID on first use.
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    ids: HashMap<Vec<u8>, KeyId>,
    keys: Vec<Vec<u8>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, key: &[u8]) -> HostResult<KeyId> {
        if let Some(id) = predefined_key_id(key) {
            return Ok(id);
        }
        if let Some(id) = self.ids.get(key) {
            return Ok(*id);
        }
        let id = next_key_id(self.keys.len())?;
        self.keys.push(key.to_vec());
        self.ids.insert(key.to_vec(), id);
        Ok(id)
    }

    /// String key as sent by `hostGetKeyID` with a non-negative size.
    pub fn intern_str(&mut self, key: &str) -> HostResult<KeyId> {
        self.intern(key.as_bytes())
    }

    /// Byte key as sent by `hostGetKeyID` with a negative size.
    pub fn intern_bytes(&mut self, key: &[u8]) -> HostResult<KeyId> {
        self.intern(key)
    }

    pub fn resolve(&self, id: KeyId) -> HostResult<&[u8]> {
        if id < 0 {
            return predefined_key(id)
                .map(str::as_bytes)
                .ok_or_else(|| HostError::internal(format!("unknown predefined key id {id}")));
        }
        usize::try_from(id)
            .ok()
            .and_then(|index| self.keys.get(index))
            .map(Vec::as_slice)
            .ok_or_else(|| HostError::internal(format!("unknown key id {id}")))
    }

    /// Number of dynamically assigned keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn next_key_id(registered: usize) -> HostResult<KeyId> {
    KeyId::try_from(registered)
        .map_err(|_| HostError::internal(format!("key registry full at {registered} keys")))
}
