use crate::core::{ContextId, FieldBitSet, ObjectHandle, ObjectId, Version};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global instance ID counter
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one in-memory instance. Clones get a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Back-link from an instance to the state manager that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineKey {
    pub(crate) context: ContextId,
    pub(crate) handle: ObjectHandle,
}

impl EngineKey {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }
}

/// Field access mode published to the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessFlags {
    /// Fields may be read and written without mediation
    #[default]
    ReadWriteOk,
    /// Reads may be direct, writes must be mediated
    ReadOk,
    /// Every access must go through the engine
    LoadRequired,
}

/// State carried by a detached instance
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedState {
    pub(crate) id: ObjectId,
    pub(crate) version: Option<Version>,
    pub(crate) loaded: FieldBitSet,
    pub(crate) modified: FieldBitSet,
}

impl DetachedState {
    pub(crate) fn new(id: ObjectId, version: Option<Version>, loaded: FieldBitSet) -> Self {
        let modified = FieldBitSet::new(loaded.len());
        Self {
            id,
            version,
            loaded,
            modified,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.id
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn loaded_fields(&self) -> &FieldBitSet {
        &self.loaded
    }

    pub fn modified_fields(&self) -> &FieldBitSet {
        &self.modified
    }

    pub fn is_dirty(&self) -> bool {
        !self.modified.is_empty()
    }
}

/// Per-instance engine slot embedded in every persistable struct.
///
/// Only crate code can point the slot at a state manager or clear it.
#[derive(Debug)]
pub struct StateSlot {
    instance: InstanceId,
    engine: Option<EngineKey>,
    flags: AccessFlags,
    detached: Option<DetachedState>,
}

impl StateSlot {
    pub fn new() -> Self {
        Self {
            instance: InstanceId::next(),
            engine: None,
            flags: AccessFlags::ReadWriteOk,
            detached: None,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn engine_key(&self) -> Option<EngineKey> {
        self.engine
    }

    pub fn is_managed(&self) -> bool {
        self.engine.is_some()
    }

    pub fn access_flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn detached_state(&self) -> Option<&DetachedState> {
        self.detached.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_some()
    }

    pub(crate) fn set_engine(&mut self, key: EngineKey) {
        self.engine = Some(key);
    }

    pub(crate) fn clear_engine(&mut self) {
        self.engine = None;
        self.flags = AccessFlags::ReadWriteOk;
    }

    pub(crate) fn set_flags(&mut self, flags: AccessFlags) {
        self.flags = flags;
    }

    pub(crate) fn set_detached(&mut self, detached: Option<DetachedState>) {
        self.detached = detached;
    }

    pub(crate) fn detached_mut(&mut self) -> Option<&mut DetachedState> {
        self.detached.as_mut()
    }
}

impl Default for StateSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StateSlot {
    /// A clone keeps the back-link of the original, which is how the engine
    /// later recognises it as a non-owning copy.
    fn clone(&self) -> Self {
        Self {
            instance: InstanceId::next(),
            engine: self.engine,
            flags: self.flags,
            detached: self.detached.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_gets_new_instance_id() {
        let mut slot = StateSlot::new();
        slot.set_engine(EngineKey {
            context: ContextId::next(),
            handle: ObjectHandle {
                index: 3,
                generation: 1,
            },
        });
        let copy = slot.clone();
        assert_ne!(copy.instance_id(), slot.instance_id());
        assert_eq!(copy.engine_key(), slot.engine_key());
    }

    #[test]
    fn test_clear_engine_resets_flags() {
        let mut slot = StateSlot::default();
        slot.set_flags(AccessFlags::LoadRequired);
        slot.clear_engine();
        assert!(!slot.is_managed());
        assert_eq!(slot.access_flags(), AccessFlags::ReadWriteOk);
    }
}
