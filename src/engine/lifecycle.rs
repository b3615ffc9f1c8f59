//! Stage changes requested directly by the caller: evict, unload,
//! make-transient, make-transactional, disconnect and close.

use super::FieldSelector;
use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldValue, ObjectHandle, ObjectRef, PersistenceError, Result};
use crate::state::{EmbeddedOwner, LifecycleEvent, LifecycleStage, Persistable, StateManager};
use tracing::{Level, event};

impl ExecutionContext {
    /// Turn a clean object hollow, releasing its field values. Objects in
    /// other stages are left alone.
    pub fn evict(&mut self, handle: ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if sm.stage != LifecycleStage::PersistentClean || sm.is_embedded() {
            event!(Level::TRACE, object = %sm.describe(), stage = %sm.stage, "evict ignored");
            return Ok(());
        }
        self.fire(handle, CallbackEvent::PreClear)?;
        self.clear_loaded_fields(handle)?;
        self.transition_object(handle, LifecycleEvent::Evict)?;
        self.fire(handle, CallbackEvent::PostClear)
    }

    pub fn evict_all(&mut self) -> Result<()> {
        for handle in self.arena.handles() {
            if self.arena.contains(handle) {
                self.evict(handle)?;
            }
        }
        Ok(())
    }

    /// Reset every loaded field but the primary key to its default and mark
    /// it unloaded. Embedded children are released.
    pub(crate) fn clear_loaded_fields(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.state_manager(handle)?;
        let class = sm.class.clone();
        let fields: Vec<usize> = sm
            .loaded
            .fields()
            .into_iter()
            .filter(|f| !class.primary_key_fields().contains(f))
            .collect();
        self.reset_fields(handle, &fields)
    }

    fn reset_fields(&mut self, handle: ObjectHandle, fields: &[usize]) -> Result<()> {
        let blank = self.arena.get(handle)?.object.new_instance();
        for &field in fields {
            self.install_field(handle, field, blank.provide_field(field))?;
        }
        let sm = self.sm_mut(handle)?;
        for &field in fields {
            sm.loaded.clear(field);
        }
        Ok(())
    }

    /// Mark one field unloaded so the next read fetches it again
    pub fn unload_field(&mut self, handle: ObjectHandle, field: impl FieldSelector) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        let field = field.resolve(&sm.class)?;
        let fmd = &sm.class.fields[field];
        if fmd.primary_key || sm.dirty.get(field) {
            return Err(PersistenceError::User(format!(
                "Field '{}' of {} cannot be unloaded: it is {}",
                fmd.name,
                sm.describe(),
                if fmd.primary_key { "a primary key" } else { "dirty" }
            )));
        }
        if sm.is_embedded() || !sm.stage.is_persistent() || sm.is_new() || !sm.loaded.get(field) {
            return Ok(());
        }
        self.reset_fields(handle, &[field])
    }

    /// Take a clean or hollow object out of management. References to other
    /// objects come back as identity tokens, embedded objects as plain
    /// copies.
    pub fn make_transient(&mut self, handle: ObjectHandle) -> Result<Box<dyn Persistable>> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if sm.is_embedded() {
            return Err(PersistenceError::User(format!(
                "{} is embedded and shares the lifecycle of its owner",
                sm.describe()
            )));
        }
        self.check_transition(handle, LifecycleEvent::MakeTransient)?;
        let sm = self.state_manager(handle)?;
        if sm.stage.is_persistent() && sm.id.is_some() {
            let dfg = sm.class.default_fetch_group_fields().clone();
            self.ensure_loaded(handle, &dfg)?;
        }

        let class = self.class_of(handle)?;
        let mut released = Vec::new();
        for field in 0..class.field_count() {
            let value = self.arena.get(handle)?.object.provide_field(field);
            let tracked = matches!(value, FieldValue::TrackedList(_) | FieldValue::TrackedMap(_));
            if !tracked && value.referenced_handles().is_empty() {
                continue;
            }
            let arena = &self.arena;
            let plain = value.try_map_refs(&mut |r| match r {
                ObjectRef::Managed(target) => {
                    let slot = arena.get(target)?;
                    if slot.sm.embedded_owner == Some(EmbeddedOwner { owner: handle, field }) {
                        let mut copy = slot.object.clone_boxed();
                        copy.state_slot_mut().clear_engine();
                        Ok(FieldValue::Ref(ObjectRef::Owned(copy)))
                    } else {
                        Ok(slot
                            .sm
                            .id
                            .clone()
                            .map(|id| FieldValue::Ref(ObjectRef::Id(id)))
                            .unwrap_or(FieldValue::Null))
                    }
                }
                other => Ok(FieldValue::Ref(other)),
            })?;
            released.push((field, plain));
        }

        self.transition_object(handle, LifecycleEvent::MakeTransient)?;
        let mut object = self.remove_object(handle)?;
        for (field, value) in released {
            object.replace_field(field, value)?;
        }
        event!(Level::DEBUG, class = class.name, "made transient");
        Ok(object)
    }

    pub fn make_transient_as<T: Persistable>(&mut self, handle: ObjectHandle) -> Result<T> {
        let object = self.make_transient(handle)?;
        let class = object.class_name();
        object
            .downcast::<T>()
            .map(|b| *b)
            .ok_or_else(|| PersistenceError::type_mismatch(std::any::type_name::<T>(), class))
    }

    /// Register a transient instance so its values are restored when the
    /// transaction rolls back
    pub fn make_transactional<T: Persistable>(&mut self, object: T) -> Result<ObjectHandle> {
        self.ensure_open()?;
        let mut object: Box<dyn Persistable> = Box::new(object);
        if let Some(key) = object.state_slot().engine_key() {
            if key.context() != self.id {
                return Err(PersistenceError::ForeignContext(object.class_name().to_string()));
            }
            if self.arena.contains(key.handle()) {
                return Ok(key.handle());
            }
            object.state_slot_mut().clear_engine();
        }
        let class = self.registry.metadata(object.class_name())?;
        let handle = self.insert_managed(object, |h, instance| {
            StateManager::for_transactional(class.clone(), h, instance)
        });
        self.adopt_containers(handle)?;
        self.enlist(handle)?;
        event!(Level::DEBUG, class = class.name, handle = %handle, "made transactional");
        Ok(handle)
    }

    /// Release `handle` from the context without any state change. Returns
    /// the instance, or None when it was already released.
    pub fn disconnect(&mut self, handle: ObjectHandle) -> Result<Option<Box<dyn Persistable>>> {
        let Ok(sm) = self.sm_mut(handle) else {
            return Ok(None);
        };
        if sm.flags.disconnecting {
            return Ok(None);
        }
        sm.flags.disconnecting = true;
        self.remove_object(handle).map(Some)
    }

    /// Roll back any active transaction and release every object
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.is_transaction_active() {
            self.rollback()?;
        }
        for handle in self.arena.handles() {
            let top_level = self
                .arena
                .get(handle)
                .is_ok_and(|slot| slot.sm.embedded_owner.is_none());
            if top_level {
                self.remove_object(handle)?;
            }
        }
        self.l1.clear();
        self.dirty.clear();
        self.dirty_set.clear();
        self.closed = true;
        event!(Level::DEBUG, context = %self.id, "execution context closed");
        Ok(())
    }

    /// Load the fetch-plan fields of `handle`
    pub fn retrieve(&mut self, handle: ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if !sm.stage.is_persistent() || sm.is_deleted() || sm.is_embedded() {
            return Ok(());
        }
        let wanted = self.fetch_plan.fields_for(&sm.class);
        self.ensure_loaded(handle, &wanted)
    }
}
