//! The per-call virtual object graph.
//!
//! Guests never see host memory. They see small integers: an [`ObjectId`]
//! naming a node, a [`KeyId`] naming a slot in it, and a [`TypeTag`] for the
//! slot's value. The [`ObjectTable`] owns every node materialized during one
//! call, caches children by `(parent, key)` so each reachable node is built
//! once, and enforces that a slot keeps the type it was first used with.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use wasmhost_types::{KeyId, ObjectId, TypeTag, OBJ_ID_NULL, OBJ_ID_ROOT};

use crate::error::{HostError, HostResult};
use crate::registry::KeyRegistry;
use crate::root::CallStores;
use crate::sandbox::SandboxHandle;

/// What a node may consult while serving a request.
#[derive(Clone, Copy)]
pub struct HostEnv<'a> {
    pub keys: &'a KeyRegistry,
    pub sandbox: Option<&'a SandboxHandle>,
    pub stores: &'a CallStores,
}

impl<'a> HostEnv<'a> {
    pub fn new(
        keys: &'a KeyRegistry,
        sandbox: Option<&'a SandboxHandle>,
        stores: &'a CallStores,
    ) -> Self {
        Self {
            keys,
            sandbox,
            stores,
        }
    }

    /// The bound sandbox; the load phase runs without one.
    pub fn sandbox(&self) -> HostResult<&'a SandboxHandle> {
        self.sandbox
            .ok_or_else(|| HostError::capability("no sandbox is bound during contract load"))
    }
}

/// Side effect a write asks the graph to apply to the node's cached children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ObjectEffect {
    None,
    DetachChildren,
}

/// A node in the object graph.
///
/// Nodes validate keys and payloads for their own shape; the table above
/// them handles caching, identity and slot types.
pub trait HostObject: Send {
    /// Short label for logs and errors.
    fn describe(&self) -> String;

    /// Type dictated by the node's shape for `key`, if any. Slots without a
    /// declared type take the type of their first access.
    fn declared_type(&self, key: KeyId) -> Option<TypeTag>;

    fn exists(&self, env: &HostEnv<'_>, key: KeyId, type_tag: TypeTag) -> HostResult<bool>;

    fn get_bytes(
        &self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
    ) -> HostResult<Option<Vec<u8>>>;

    fn set_bytes(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
        value: &[u8],
    ) -> HostResult<ObjectEffect>;

    fn del_key(&mut self, env: &HostEnv<'_>, key: KeyId, type_tag: TypeTag)
        -> HostResult<ObjectEffect>;

    /// Build the child container stored under `key`.
    fn create_child(
        &mut self,
        env: &HostEnv<'_>,
        key: KeyId,
        type_tag: TypeTag,
    ) -> HostResult<Box<dyn HostObject>>;
}

/// Object 0: reads see nothing, writes fail.
#[derive(Debug, Default)]
pub struct NullObject;

impl HostObject for NullObject {
    fn describe(&self) -> String {
        "null".to_string()
    }

    fn declared_type(&self, _key: KeyId) -> Option<TypeTag> {
        None
    }

    fn exists(&self, _env: &HostEnv<'_>, _key: KeyId, _type_tag: TypeTag) -> HostResult<bool> {
        Ok(false)
    }

    fn get_bytes(
        &self,
        _env: &HostEnv<'_>,
        _key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set_bytes(
        &mut self,
        _env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
        _value: &[u8],
    ) -> HostResult<ObjectEffect> {
        Err(HostError::protocol(format!("write to null object, key {key}")))
    }

    fn del_key(
        &mut self,
        _env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<ObjectEffect> {
        Err(HostError::protocol(format!("delete on null object, key {key}")))
    }

    fn create_child(
        &mut self,
        _env: &HostEnv<'_>,
        key: KeyId,
        _type_tag: TypeTag,
    ) -> HostResult<Box<dyn HostObject>> {
        Err(HostError::protocol(format!("null object has no child {key}")))
    }
}

struct ObjectSlot {
    owner: ObjectId,
    key: KeyId,
    children: HashMap<KeyId, ObjectId>,
    types: HashMap<KeyId, TypeTag>,
    object: Box<dyn HostObject>,
}

impl ObjectSlot {
    fn new(owner: ObjectId, key: KeyId, object: Box<dyn HostObject>) -> Self {
        Self {
            owner,
            key,
            children: HashMap::new(),
            types: HashMap::new(),
            object,
        }
    }
}

/// Arena of the nodes materialized during one call.
///
/// IDs are indices and are never reused; detaching only drops the parent's
/// cache entry.
pub struct ObjectTable {
    slots: Vec<ObjectSlot>,
}

impl ObjectTable {
    /// A table holding the null object (0) and `root` (1).
    pub fn new(root: Box<dyn HostObject>) -> Self {
        Self {
            slots: vec![
                ObjectSlot::new(OBJ_ID_NULL, 0, Box::new(NullObject)),
                ObjectSlot::new(OBJ_ID_ROOT, 0, root),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: ObjectId) -> HostResult<&ObjectSlot> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or_else(|| HostError::protocol(format!("unknown object id {id}")))
    }

    fn slot_mut(&mut self, id: ObjectId) -> HostResult<&mut ObjectSlot> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .ok_or_else(|| HostError::protocol(format!("unknown object id {id}")))
    }

    pub fn find(&self, id: ObjectId) -> HostResult<&dyn HostObject> {
        Ok(self.slot(id)?.object.as_ref())
    }

    pub fn find_mut(&mut self, id: ObjectId) -> HostResult<&mut dyn HostObject> {
        Ok(self.slot_mut(id)?.object.as_mut())
    }

    pub fn owner_of(&self, id: ObjectId) -> HostResult<ObjectId> {
        Ok(self.slot(id)?.owner)
    }

    pub fn key_of(&self, id: ObjectId) -> HostResult<KeyId> {
        Ok(self.slot(id)?.key)
    }

    /// Cached child of `parent` under `key`.
    pub fn child(&self, parent: ObjectId, key: KeyId) -> Option<ObjectId> {
        self.slot(parent).ok()?.children.get(&key).copied()
    }

    /// Enforce the slot type of `(id, key)`, registering it on first use.
    pub fn check_type(&mut self, id: ObjectId, key: KeyId, requested: TypeTag) -> HostResult<()> {
        let slot = self.slot_mut(id)?;
        let mismatch = |declared| HostError::TypeMismatch {
            object: id,
            key,
            declared,
            requested,
        };
        if let Some(declared) = slot.object.declared_type(key) {
            return if declared == requested {
                Ok(())
            } else {
                Err(mismatch(declared))
            };
        }
        match slot.types.entry(key) {
            Entry::Occupied(seen) if *seen.get() != requested => Err(mismatch(*seen.get())),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(requested);
                Ok(())
            }
        }
    }

    /// Return the child of `parent` under `key`, building it with `factory`
    /// on first access. The factory receives the parent node.
    pub fn get_or_create<F>(
        &mut self,
        parent: ObjectId,
        key: KeyId,
        type_tag: TypeTag,
        factory: F,
    ) -> HostResult<ObjectId>
    where
        F: FnOnce(&mut dyn HostObject) -> HostResult<Box<dyn HostObject>>,
    {
        self.check_type(parent, key, type_tag)?;
        if let Some(id) = self.child(parent, key) {
            return Ok(id);
        }
        let child = factory(self.find_mut(parent)?)?;
        let id = ObjectId::try_from(self.slots.len())
            .map_err(|_| HostError::internal("object table exhausted"))?;
        self.slots.push(ObjectSlot::new(parent, key, child));
        self.slot_mut(parent)?.children.insert(key, id);
        Ok(id)
    }

    /// Drop the cached child of `parent` under `key`.
    pub fn detach(&mut self, parent: ObjectId, key: KeyId) -> HostResult<Option<ObjectId>> {
        Ok(self.slot_mut(parent)?.children.remove(&key))
    }

    /// Drop every cached child of `parent`.
    pub fn detach_all(&mut self, parent: ObjectId) -> HostResult<()> {
        self.slot_mut(parent)?.children.clear();
        Ok(())
    }

    /// Apply a node's requested side effect.
    pub fn apply(&mut self, id: ObjectId, effect: ObjectEffect) -> HostResult<()> {
        match effect {
            ObjectEffect::None => Ok(()),
            ObjectEffect::DetachChildren => self.detach_all(id),
        }
    }
}
