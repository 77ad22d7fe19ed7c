//! Key/value storage seam and the in-memory `Dict`.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use wasmhost_types::{BytesDecoder, BytesEncoder, CodecError};

use crate::error::HostResult;

/// Flat byte-keyed store behind every container node.
///
/// Chain state, call parameters and the scratch stores all implement this;
/// container nodes only ever see `Arc<dyn KvStore>`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>>;

    fn has(&self, key: &[u8]) -> HostResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> HostResult<()>;

    fn del(&self, key: &[u8]) -> HostResult<()>;

    /// Visit every entry whose key starts with `prefix`, in key order,
    /// until `f` returns `false`.
    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> HostResult<()>;
}

/// Ordered in-memory map used for params, results and scratch state.
///
/// Wire form: `uvarint count` then `bytes(key) bytes(value)` per entry in
/// key order.
#[derive(Default)]
pub struct Dict {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.entries.read().clone()
    }

    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Replace the whole content with `other`'s entries.
    pub fn replace_with(&self, other: &Dict) {
        let snapshot = other.entries();
        *self.entries.write() = snapshot;
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self.entries.read();
        let mut enc = BytesEncoder::new();
        enc.write_uvarint(entries.len() as u64);
        for (key, value) in entries.iter() {
            enc.write_bytes(key).write_bytes(value);
        }
        enc.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = BytesDecoder::new(bytes);
        let dict = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(dict)
    }

    /// Decode a dict blob embedded in a larger buffer.
    pub fn decode(dec: &mut BytesDecoder<'_>) -> Result<Self, CodecError> {
        let count = dec.read_uvarint()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = dec.read_bytes()?.to_vec();
            let value = dec.read_bytes()?.to_vec();
            entries.insert(key, value);
        }
        Ok(Self::from(entries))
    }
}

impl From<BTreeMap<Vec<u8>, Vec<u8>>> for Dict {
    fn from(entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl Clone for Dict {
    fn clone(&self) -> Self {
        Self::from(self.entries())
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries() == other.entries()
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_map()
            .entries(entries.iter().map(|(k, v)| (hex::encode(k), hex::encode(v))))
            .finish()
    }
}

impl KvStore for Dict {
    fn get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>> {
        Ok(self.get_value(key))
    }

    fn has(&self, key: &[u8]) -> HostResult<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> HostResult<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> HostResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> HostResult<()> {
        // Snapshot so the visitor may write back into this dict.
        let matching: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &matching {
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }
}
