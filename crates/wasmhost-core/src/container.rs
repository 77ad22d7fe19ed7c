//! KV-backed map and array nodes.
//!
//! Every container in the graph (state, params, results, scratch maps, ...)
//! is a [`KvContainer`]: a window onto a [`KvStore`] at a nested key path.
//! Paths nest as `parent '.' escape(key)` for map children and
//! `parent '#' index` for array elements; an array keeps its length as an
//! `Int32` at its own path.

use std::sync::Arc;

use wasmhost_types::keys::KEY_LENGTH;
use wasmhost_types::{KeyId, TypeKind, TypeTag};

use crate::error::{HostError, HostResult};
use crate::kv::KvStore;
use crate::object::{HostEnv, HostObject, ObjectEffect};

const MAP_SEPARATOR: u8 = b'.';
const INDEX_SEPARATOR: u8 = b'#';
const ESCAPE: u8 = b'\\';

fn escape_into(out: &mut Vec<u8>, key: &[u8]) {
    for &b in key {
        if matches!(b, MAP_SEPARATOR | INDEX_SEPARATOR | ESCAPE) {
            out.push(ESCAPE);
        }
        out.push(b);
    }
}

/// Storage key of map entry `key` below `path`.
pub fn nested_map_key(path: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() + key.len() + 1);
    out.extend_from_slice(path);
    if !path.is_empty() {
        out.push(MAP_SEPARATOR);
    }
    escape_into(&mut out, key);
    out
}

/// Storage key of array element `index` below `path`.
pub fn nested_index_key(path: &[u8], index: u32) -> Vec<u8> {
    let mut out = path.to_vec();
    out.push(INDEX_SEPARATOR);
    out.extend_from_slice(index.to_string().as_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Map,
    Array(TypeKind),
}

pub struct KvContainer {
    label: &'static str,
    store: Arc<dyn KvStore>,
    path: Vec<u8>,
    shape: Shape,
    mutable: bool,
}

impl KvContainer {
    pub fn map(label: &'static str, store: Arc<dyn KvStore>, mutable: bool) -> Self {
        Self {
            label,
            store,
            path: Vec::new(),
            shape: Shape::Map,
            mutable,
        }
    }

    pub fn array(
        label: &'static str,
        store: Arc<dyn KvStore>,
        element: TypeKind,
        mutable: bool,
    ) -> Self {
        Self {
            label,
            store,
            path: Vec::new(),
            shape: Shape::Array(element),
            mutable,
        }
    }

    /// Container for the given root tag: `Map` or `Array<kind>`.
    pub fn for_tag(
        label: &'static str,
        store: Arc<dyn KvStore>,
        type_tag: TypeTag,
        mutable: bool,
    ) -> HostResult<Self> {
        let shape = shape_of(type_tag)?;
        Ok(Self {
            label,
            store,
            path: Vec::new(),
            shape,
            mutable,
        })
    }

    fn nested(&self, path: Vec<u8>, shape: Shape) -> Self {
        Self {
            label: self.label,
            store: Arc::clone(&self.store),
            path,
            shape,
            mutable: self.mutable,
        }
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Element count of an array container.
    pub fn length(&self) -> HostResult<u32> {
        match self.store.get(&self.path)? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    HostError::internal(format!("{}: corrupt array length", self.describe()))
                })?;
                Ok(u32::from_le_bytes(raw))
            }
        }
    }

    fn set_length(&self, len: u32) -> HostResult<()> {
        self.store.set(&self.path, &len.to_le_bytes())
    }

    fn ensure_mutable(&self) -> HostResult<()> {
        if self.mutable {
            Ok(())
        } else {
            Err(HostError::capability(format!("{} is read-only", self.describe())))
        }
    }

    fn index_of(&self, key: KeyId) -> HostResult<u32> {
        u32::try_from(key)
            .map_err(|_| HostError::protocol(format!("{}: invalid index key {key}", self.describe())))
    }

    fn map_key(&self, env: &HostEnv<'_>, key: KeyId) -> HostResult<Vec<u8>> {
        if key == KEY_LENGTH {
            return Err(HostError::protocol(format!(
                "{}: length is only valid as a clear request on maps",
                self.describe()
            )));
        }
        Ok(nested_map_key(&self.path, env.keys.resolve(key)?))
    }

    fn clear_map(&self) -> HostResult<()> {
        let prefix = if self.path.is_empty() {
            Vec::new()
        } else {
            let mut p = self.path.clone();
            p.push(MAP_SEPARATOR);
            p
        };
        let mut doomed = Vec::new();
        self.store.iterate_prefix(&prefix, &mut |key, _| {
            doomed.push(key.to_vec());
            true
        })?;
        for key in doomed {
            self.store.del(&key)?;
        }
        Ok(())
    }

    fn decode_clear_request(&self, value: &[u8]) -> HostResult<()> {
        match <[u8; 4]>::try_from(value).map(u32::from_le_bytes) {
            Ok(0) => Ok(()),
            _ => Err(HostError::protocol(format!(
                "{}: length can only be set to 0",
                self.describe()
            ))),
        }
    }

    fn check_payload(&self, type_tag: TypeTag, value: &[u8]) -> HostResult<()> {
        type_tag.validate(value).map_err(|e| {
            HostError::protocol(format!("{}: {e}", self.describe()))
        })
    }
}

fn shape_of(type_tag: TypeTag) -> HostResult<Shape> {
    match type_tag {
        TypeTag::Value(TypeKind::Map) => Ok(Shape::Map),
        TypeTag::Array(kind) => Ok(Shape::Array(kind)),
        other => Err(HostError::protocol(format!("{other} is not a container type"))),
    }
}

fn reject_container(type_tag: TypeTag) -> HostResult<()> {
    if type_tag.is_container() {
        Err(HostError::protocol(format!(
            "{type_tag} values are reached through get_object_id"
        )))
    } else {
        Ok(())
    }
}

impl HostObject for KvContainer {
    fn describe(&self) -> String {
        let kind = match self.shape {
            Shape::Map => "map".to_string(),
            Shape::Array(kind) => format!("array<{}>", kind.name()),
        };
        if self.path.is_empty() {
            format!("{} {}", self.label, kind)
        } else {
            format!("{} {} at {}", self.label, kind, String::from_utf8_lossy(&self.path))
        }
    }

    fn declared_type(&self, key: KeyId) -> Option<TypeTag> {
        if key == KEY_LENGTH {
            return Some(TypeTag::INT32);
        }
        match self.shape {
            Shape::Map => None,
            Shape::Array(kind) if key >= 0 => Some(TypeTag::Value(kind)),
            Shape::Array(_) => None,
        }
    }

    fn exists(&self, env: &HostEnv<'_>, key: KeyId, type_tag: TypeTag) -> HostResult<bool> {
        match self.shape {
            Shape::Map => {
                let nested = self.map_key(env, key)?;
                if type_tag == TypeTag::MAP {
                    let mut prefix = nested;
                    prefix.push(MAP_SEPARATOR);
                    let mut found = false;
                    self.store.iterate_prefix(&prefix, &mut |_, _| {
                        found = true;
                        false
                    })?;
                    Ok(found)
                } else {
                    self.store.has(&nested)
                }
            }
            Shape::Array(_) if key == KEY_LENGTH => Ok(true),
            Shape::Array(_) => match u32::try_from(key) {
                Ok(index) => Ok(index < self.length()?),
                Err(_) => Ok(false),
            },
        }
    }

    fn get_bytes(
        &self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
    ) -> HostResult<Option<Vec<u8>>> {
        reject_container(type_tag)?;
        match self.shape {
            Shape::Map => {
                let value = self.store.get(&self.map_key(env, key)?)?;
                if let Some(bytes) = &value {
                    self.check_payload(type_tag, bytes)?;
                }
                Ok(value)
            }
            Shape::Array(_) if key == KEY_LENGTH => Ok(Some(self.length()?.to_le_bytes().to_vec())),
            Shape::Array(_) => {
                let index = self.index_of(key)?;
                let len = self.length()?;
                if index >= len {
                    return Err(HostError::protocol(format!(
                        "{}: index {index} out of range (length {len})",
                        self.describe()
                    )));
                }
                let value = self.store.get(&nested_index_key(&self.path, index))?;
                if let Some(bytes) = &value {
                    self.check_payload(type_tag, bytes)?;
                }
                Ok(value)
            }
        }
    }

    fn set_bytes(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
        value: &[u8],
    ) -> HostResult<ObjectEffect> {
        self.ensure_mutable()?;
        reject_container(type_tag)?;
        match self.shape {
            Shape::Map if key == KEY_LENGTH => {
                self.decode_clear_request(value)?;
                self.clear_map()?;
                Ok(ObjectEffect::DetachChildren)
            }
            Shape::Map => {
                self.check_payload(type_tag, value)?;
                self.store.set(&self.map_key(env, key)?, value)?;
                Ok(ObjectEffect::None)
            }
            Shape::Array(_) if key == KEY_LENGTH => {
                self.decode_clear_request(value)?;
                self.set_length(0)?;
                Ok(ObjectEffect::DetachChildren)
            }
            Shape::Array(kind) => {
                if kind == TypeKind::Map {
                    return Err(HostError::protocol(format!(
                        "{}: map elements are reached through get_object_id",
                        self.describe()
                    )));
                }
                let index = self.index_of(key)?;
                let len = self.length()?;
                if index > len {
                    return Err(HostError::protocol(format!(
                        "{}: write at {index} leaves a gap (length {len})",
                        self.describe()
                    )));
                }
                self.check_payload(type_tag, value)?;
                self.store.set(&nested_index_key(&self.path, index), value)?;
                if index == len {
                    self.set_length(len + 1)?;
                }
                Ok(ObjectEffect::None)
            }
        }
    }

    fn del_key(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<ObjectEffect> {
        self.ensure_mutable()?;
        match self.shape {
            Shape::Map => {
                self.store.del(&self.map_key(env, key)?)?;
                Ok(ObjectEffect::None)
            }
            Shape::Array(_) => Err(HostError::protocol(format!(
                "{}: array elements cannot be deleted, clear the array instead",
                self.describe()
            ))),
        }
    }

    fn create_child(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
    ) -> HostResult<Box<dyn HostObject>> {
        let shape = shape_of(type_tag)?;
        match self.shape {
            Shape::Map => {
                let path = self.map_key(env, key)?;
                Ok(Box::new(self.nested(path, shape)))
            }
            Shape::Array(_) => {
                let index = self.index_of(key)?;
                let len = self.length()?;
                if index > len || (index == len && !self.mutable) {
                    return Err(HostError::protocol(format!(
                        "{}: no element {index} (length {len})",
                        self.describe()
                    )));
                }
                if index == len {
                    self.set_length(len + 1)?;
                }
                Ok(Box::new(self.nested(nested_index_key(&self.path, index), shape)))
            }
        }
    }
}
