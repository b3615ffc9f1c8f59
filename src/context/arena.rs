// ============================================================================
// Object Arena
// ============================================================================
//
// Slot table owned by an execution context. Each occupied slot pairs a
// managed instance with its StateManager. Handles carry the slot generation,
// so a handle to an object that has left the context never reaches whatever
// later reuses the slot. Embedded objects are indexed by their owner so
// that removing an owner finds its children without a scan.
//
// ============================================================================

use crate::core::{ObjectHandle, PersistenceError, Result};
use crate::state::{Persistable, StateManager};
use std::collections::HashMap;

#[derive(Debug)]
pub struct ManagedSlot {
    pub(crate) sm: StateManager,
    pub(crate) object: Box<dyn Persistable>,
}

impl ManagedSlot {
    pub fn state_manager(&self) -> &StateManager {
        &self.sm
    }

    pub fn object(&self) -> &dyn Persistable {
        self.object.as_ref()
    }
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Option<ManagedSlot>,
}

#[derive(Debug, Default)]
pub struct ObjectArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    len: usize,
    embedded: HashMap<ObjectHandle, Vec<ObjectHandle>>,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a handle and fill its slot with what `make` builds for it
    pub(crate) fn insert_with<F>(&mut self, make: F) -> ObjectHandle
    where
        F: FnOnce(ObjectHandle) -> ManagedSlot,
    {
        let handle = match self.free.pop() {
            Some(index) => ObjectHandle {
                index,
                generation: self.entries[index as usize].generation,
            },
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: None,
                });
                ObjectHandle {
                    index: (self.entries.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        let slot = make(handle);
        if let Some(link) = slot.sm.embedded_owner {
            self.embedded.entry(link.owner).or_default().push(handle);
        }
        self.entries[handle.index as usize].slot = Some(slot);
        self.len += 1;
        handle
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&ManagedSlot> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.slot.as_ref())
            .ok_or_else(|| PersistenceError::InvalidHandle(handle.to_string()))
    }

    pub(crate) fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut ManagedSlot> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.slot.as_mut())
            .ok_or_else(|| PersistenceError::InvalidHandle(handle.to_string()))
    }

    pub(crate) fn remove(&mut self, handle: ObjectHandle) -> Result<ManagedSlot> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation && e.slot.is_some())
            .ok_or_else(|| PersistenceError::InvalidHandle(handle.to_string()))?;
        let slot = entry
            .slot
            .take()
            .ok_or_else(|| PersistenceError::InvalidHandle(handle.to_string()))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        if let Some(link) = slot.sm.embedded_owner {
            if let Some(children) = self.embedded.get_mut(&link.owner) {
                children.retain(|c| *c != handle);
                if children.is_empty() {
                    self.embedded.remove(&link.owner);
                }
            }
        }
        self.embedded.remove(&handle);
        Ok(slot)
    }

    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slot.is_some())
            .map(|(i, e)| ObjectHandle {
                index: i as u32,
                generation: e.generation,
            })
            .collect()
    }

    /// Embedded objects owned by `owner`
    pub fn embedded_children(&self, owner: ObjectHandle) -> Vec<ObjectHandle> {
        self.embedded.get(&owner).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
