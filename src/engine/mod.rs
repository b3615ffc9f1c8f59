// ============================================================================
// Lifecycle Engine
// ============================================================================
//
// The operations of an execution context on its managed objects. Every
// managed instance lives in the context arena next to its StateManager; the
// engine addresses them by handle and drives:
//
// - field mediation (get/set with load-on-demand and dirty tracking)
// - persistence by reachability and flush orchestration
// - delete with cascades, detach/attach of object graphs
// - loads through the second-level cache and the persistence handler
// - the end-of-transaction transitions
//
// This file holds the shared plumbing: stage transitions, callbacks, the
// transaction enlistment and the low-level value installation.
//
// ============================================================================

mod attach;
mod delete;
mod detach;
mod find;
mod flush;
mod lifecycle;
mod mediation;
mod persist;
mod transaction;

pub use detach::{DetachState, DetachedGraph};

use crate::context::provider::{Externalizer, Unresolved};
use crate::context::{CallbackEvent, ExecutionContext, ListenerContext};
use crate::core::{FieldValue, ObjectHandle, ObjectId, ObjectRef, PersistenceError, Result, Version};
use crate::fieldmanager::{FieldManager, UnsetOwnerFieldManager};
use crate::metadata::ClassMetadata;
use crate::state::{
    AccessFlags, EmbeddedOwner, LifecycleEvent, LifecycleStage, StateManager, TransitionOptions,
    transition,
};
use crate::state::manager::SavedState;
use crate::types::OwnerLink;
use crate::types::tracked::{set_tracked_owner, tracked_owner, unset_tracked_owner};
use std::sync::Arc;
use tracing::{Level, event};

/// Anything that names a field of a class: its number or its name.
pub trait FieldSelector {
    fn resolve(&self, class: &ClassMetadata) -> Result<usize>;
}

impl FieldSelector for usize {
    fn resolve(&self, class: &ClassMetadata) -> Result<usize> {
        if *self < class.field_count() {
            Ok(*self)
        } else {
            Err(PersistenceError::UnknownField {
                class: class.name.to_string(),
                field: self.to_string(),
            })
        }
    }
}

impl FieldSelector for &str {
    fn resolve(&self, class: &ClassMetadata) -> Result<usize> {
        class.require_field(self)
    }
}

/// Where a value being installed into a managed object came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// A persistence handler: field converters still apply, dangling
    /// references become null
    Store,
    /// A second-level cache snapshot: a dangling reference is an error the
    /// caller recovers from
    Cache,
    /// The inline image of an embedded object
    Embedded,
}

pub(crate) fn access_flags_for(stage: LifecycleStage) -> AccessFlags {
    match stage {
        LifecycleStage::PersistentClean | LifecycleStage::TransientClean => AccessFlags::ReadOk,
        LifecycleStage::Hollow
        | LifecycleStage::PersistentDeleted
        | LifecycleStage::PersistentNewDeleted => AccessFlags::LoadRequired,
        _ => AccessFlags::ReadWriteOk,
    }
}

/// Copy taken for rollback: tracked containers get their own storage
fn saved_copy(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::TrackedList(list) => FieldValue::TrackedList(list.deep_copy()),
        FieldValue::TrackedMap(map) => FieldValue::TrackedMap(map.deep_copy()),
        other => other,
    }
}

fn same_tracked(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::TrackedList(x), FieldValue::TrackedList(y)) => x.ptr_eq(y),
        (FieldValue::TrackedMap(x), FieldValue::TrackedMap(y)) => x.ptr_eq(y),
        _ => false,
    }
}

fn holds_identity_tokens(value: &FieldValue) -> bool {
    let mut found = false;
    value.visit_refs(&mut |r| {
        if matches!(r, ObjectRef::Id(_)) {
            found = true;
        }
    });
    found
}

impl ExecutionContext {
    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state_manager(&self, handle: ObjectHandle) -> Result<&StateManager> {
        Ok(&self.arena.get(handle)?.sm)
    }

    pub(crate) fn sm_mut(&mut self, handle: ObjectHandle) -> Result<&mut StateManager> {
        Ok(&mut self.arena.get_mut(handle)?.sm)
    }

    pub fn stage(&self, handle: ObjectHandle) -> Result<LifecycleStage> {
        Ok(self.state_manager(handle)?.stage)
    }

    pub fn object_id(&self, handle: ObjectHandle) -> Result<Option<ObjectId>> {
        Ok(self.state_manager(handle)?.id.clone())
    }

    pub fn version(&self, handle: ObjectHandle) -> Result<Option<Version>> {
        Ok(self.state_manager(handle)?.version.clone())
    }

    pub fn is_loaded(&self, handle: ObjectHandle, field: impl FieldSelector) -> Result<bool> {
        let sm = self.state_manager(handle)?;
        let field = field.resolve(&sm.class)?;
        Ok(sm.loaded.get(field))
    }

    pub fn is_dirty(&self, handle: ObjectHandle) -> Result<bool> {
        Ok(self.state_manager(handle)?.is_dirty())
    }

    pub(crate) fn class_of(&self, handle: ObjectHandle) -> Result<Arc<ClassMetadata>> {
        Ok(self.state_manager(handle)?.class.clone())
    }

    /// Direct view of a managed instance, without loading anything
    pub fn peek<T: crate::state::Persistable>(&self, handle: ObjectHandle) -> Option<&T> {
        self.arena.get(handle).ok()?.object.downcast_ref::<T>()
    }

    // ------------------------------------------------------------------
    // Transitions and callbacks
    // ------------------------------------------------------------------

    /// Stage `event` would lead to, or IllegalTransition
    pub(crate) fn check_transition(
        &self,
        handle: ObjectHandle,
        event: LifecycleEvent,
    ) -> Result<LifecycleStage> {
        let sm = self.state_manager(handle)?;
        transition(sm.stage, event, TransitionOptions::default()).ok_or_else(|| {
            PersistenceError::IllegalTransition {
                object: sm.describe(),
                stage: sm.stage,
                event,
            }
        })
    }

    pub(crate) fn transition_object(
        &mut self,
        handle: ObjectHandle,
        event: LifecycleEvent,
    ) -> Result<LifecycleStage> {
        let options = TransitionOptions {
            retain_values: self.config.retain_values,
        };
        self.transition_with(handle, event, options)
    }

    pub(crate) fn transition_with(
        &mut self,
        handle: ObjectHandle,
        event: LifecycleEvent,
        options: TransitionOptions,
    ) -> Result<LifecycleStage> {
        let slot = self.arena.get_mut(handle)?;
        let from = slot.sm.stage;
        let to = transition(from, event, options).ok_or_else(|| {
            PersistenceError::IllegalTransition {
                object: slot.sm.describe(),
                stage: from,
                event,
            }
        })?;
        if from != to {
            event!(
                Level::DEBUG,
                object = %slot.sm.describe(),
                from = %from,
                to = %to,
                event = %event,
                "lifecycle transition"
            );
            slot.sm.stage = to;
        }
        slot.object.state_slot_mut().set_flags(access_flags_for(to));
        Ok(to)
    }

    /// Publish the access flags matching the current stage to the instance
    pub fn replace_flags(&mut self, handle: ObjectHandle) -> Result<()> {
        let slot = self.arena.get_mut(handle)?;
        let flags = access_flags_for(slot.sm.stage);
        slot.object.state_slot_mut().set_flags(flags);
        Ok(())
    }

    pub(crate) fn fire(&mut self, handle: ObjectHandle, callback: CallbackEvent) -> Result<()> {
        if self.listeners.is_empty() {
            return Ok(());
        }
        let class = self.state_manager(handle)?.class.name;
        let listeners: Vec<_> = self
            .listeners
            .iter()
            .filter(|l| l.classes().is_none_or(|classes| classes.contains(&class)))
            .cloned()
            .collect();
        for listener in listeners {
            event!(Level::TRACE, object = %handle, callback = %callback, "callback");
            let mut object = ListenerContext::new(self, handle);
            listener.on_event(callback, &mut object)?;
        }
        Ok(())
    }

    /// Run `f` as part of a stage change of `handle`; a post-load callback
    /// raised meanwhile is held back until it is done.
    pub(crate) fn changing_state<R>(
        &mut self,
        handle: ObjectHandle,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let nested = {
            let sm = self.sm_mut(handle)?;
            std::mem::replace(&mut sm.flags.changing_state, true)
        };
        let result = f(self);
        if nested {
            return result;
        }
        let pending = match self.arena.get_mut(handle) {
            Ok(slot) => {
                slot.sm.flags.changing_state = false;
                std::mem::take(&mut slot.sm.flags.post_load_pending)
            }
            Err(_) => false,
        };
        let value = result?;
        if pending {
            self.fire(handle, CallbackEvent::Load)?;
        }
        Ok(value)
    }

    pub(crate) fn post_load(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.sm_mut(handle)?;
        if sm.flags.changing_state {
            sm.flags.post_load_pending = true;
            return Ok(());
        }
        self.fire(handle, CallbackEvent::Load)
    }

    // ------------------------------------------------------------------
    // Transaction enlistment and dirty list
    // ------------------------------------------------------------------

    pub(crate) fn enlist(&mut self, handle: ObjectHandle) -> Result<()> {
        let Some(txn) = self.txn.as_mut().filter(|t| t.is_active()) else {
            return Ok(());
        };
        if txn.enlist(handle) && !self.stage(handle)?.is_new() {
            self.save_fields(handle)?;
        }
        Ok(())
    }

    pub(crate) fn mark_dirty_list(&mut self, handle: ObjectHandle) {
        if self.dirty_set.insert(handle) {
            self.dirty.push(handle);
        }
    }

    /// Capture the current field values for rollback. Embedded objects are
    /// kept as inline images so they can be rebuilt.
    pub(crate) fn save_fields(&mut self, handle: ObjectHandle) -> Result<()> {
        let slot = self.arena.get(handle)?;
        if slot.sm.saved.is_some() {
            return Ok(());
        }
        let externalizer = Externalizer {
            arena: &self.arena,
            unresolved: Unresolved::Null,
            inline_embedded: true,
        };
        let label = slot.sm.describe();
        let mut values = Vec::with_capacity(slot.sm.class.field_count());
        for field in 0..slot.sm.class.field_count() {
            let value = slot.object.provide_field(field);
            let embedded = slot.sm.class.field_meta(field).is_some_and(|f| f.embedded);
            if embedded && value.as_handle().is_some() {
                let (image, _) = externalizer.value(&label, value)?;
                values.push(image.unwrap_or(FieldValue::Null));
            } else {
                values.push(saved_copy(value));
            }
        }
        let loaded = slot.sm.loaded.clone();
        self.sm_mut(handle)?.saved = Some(SavedState { values, loaded });
        Ok(())
    }

    /// Put back the values captured by `save_fields`
    pub(crate) fn restore_fields(&mut self, handle: ObjectHandle) -> Result<()> {
        let Some(saved) = self.sm_mut(handle)?.saved.take() else {
            return Ok(());
        };
        for field in saved.loaded.fields() {
            let value = saved.values[field].clone();
            let value = match value {
                FieldValue::Embedded(_) => {
                    self.internalize_value(handle, field, value, ValueSource::Embedded)?
                }
                other if other.referenced_handles().iter().any(|h| !self.arena.contains(*h)) => {
                    let arena = &self.arena;
                    other.try_map_refs(&mut |r| match r {
                        ObjectRef::Managed(h) if !arena.contains(h) => Ok(FieldValue::Null),
                        other => Ok(FieldValue::Ref(other)),
                    })?
                }
                other => other,
            };
            self.install_field(handle, field, value)?;
        }
        let sm = self.sm_mut(handle)?;
        sm.loaded = saved.loaded;
        sm.dirty.clear_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // L1 cache and identity
    // ------------------------------------------------------------------

    pub(crate) fn l1_put(&mut self, id: ObjectId, handle: ObjectHandle) -> Result<()> {
        if let Some(existing) = self.l1.get(&id) {
            if *existing != handle && self.arena.contains(*existing) {
                return Err(PersistenceError::DuplicateObject(id.to_string()));
            }
        }
        self.l1.insert(id, handle);
        Ok(())
    }

    /// Replace the identity of `handle`, re-keying the L1 cache and the
    /// primary-key fields
    pub(crate) fn set_post_store_identity(&mut self, handle: ObjectHandle, id: ObjectId) -> Result<()> {
        let slot = self.arena.get_mut(handle)?;
        if let Some(old) = slot.sm.id.take() {
            if self.l1.get(&old) == Some(&handle) {
                self.l1.remove(&old);
            }
        }
        let pk_fields = slot.sm.class.primary_key_fields().to_vec();
        let components: Vec<FieldValue> = id
            .key()
            .components()
            .into_iter()
            .map(|c| c.to_field_value())
            .collect();
        for (field, value) in pk_fields.into_iter().zip(components) {
            slot.object.replace_field(field, value)?;
        }
        event!(Level::DEBUG, handle = %handle, object = %id, "identity assigned");
        slot.sm.id = Some(id.clone());
        self.l1_put(id, handle)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub(crate) fn field_values(
        &self,
        handle: ObjectHandle,
        fields: &[usize],
    ) -> Result<Vec<(usize, FieldValue)>> {
        let slot = self.arena.get(handle)?;
        Ok(fields
            .iter()
            .map(|&f| (f, slot.object.provide_field(f)))
            .collect())
    }

    /// Hand the values of `fields` to `manager`, as they are in memory
    pub fn provide_fields(
        &self,
        handle: ObjectHandle,
        fields: &[usize],
        manager: &mut dyn FieldManager,
    ) -> Result<()> {
        let slot = self.arena.get(handle)?;
        for &field in fields {
            manager.store_field(field, slot.object.provide_field(field))?;
        }
        Ok(())
    }

    /// Install the values `manager` supplies for `fields`; they count as loaded
    pub fn replace_fields(
        &mut self,
        handle: ObjectHandle,
        fields: &[usize],
        manager: &mut dyn FieldManager,
    ) -> Result<()> {
        let class = self.class_of(handle)?;
        for &field in fields {
            let field = field.resolve(&class)?;
            let value = manager.fetch_field(field)?;
            self.install_field(handle, field, value)?;
        }
        Ok(())
    }

    /// Low-level replace: moves tracked ownership and embedded children
    /// along with the value and marks the field loaded. Returns the old value.
    pub(crate) fn install_field(
        &mut self,
        handle: ObjectHandle,
        field: usize,
        value: FieldValue,
    ) -> Result<FieldValue> {
        let slot = self.arena.get_mut(handle)?;
        let old = slot.object.provide_field(field);
        if !same_tracked(&old, &value)
            && tracked_owner(&old) == Some(OwnerLink { object: handle, field })
        {
            unset_tracked_owner(&old);
        }
        let new_child = value.as_handle();
        set_tracked_owner(&value, OwnerLink { object: handle, field }, &self.containers);
        slot.object.replace_field(field, value)?;
        slot.sm.loaded.set(field);

        if let Some(child) = old.as_handle().filter(|c| Some(*c) != new_child) {
            let owned_here = self.arena.get(child).is_ok_and(|s| {
                s.sm.embedded_owner == Some(EmbeddedOwner { owner: handle, field })
            });
            if owned_here {
                self.remove_object(child)?;
            }
        }
        Ok(old)
    }

    /// Turn a value from a store or a cache into its in-memory form:
    /// converters undone, embedded images materialized, identity tokens
    /// resolved to managed objects and containers wrapped.
    pub(crate) fn internalize_value(
        &mut self,
        handle: ObjectHandle,
        field: usize,
        value: FieldValue,
        source: ValueSource,
    ) -> Result<FieldValue> {
        let class = self.class_of(handle)?;
        let fmd = class
            .field_meta(field)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownField {
                class: class.name.to_string(),
                field: field.to_string(),
            })?;

        let mut value = value;
        if source == ValueSource::Store {
            if let Some(converter) = self.types().converter_for_field(&fmd) {
                value = converter.from_datastore(value)?;
            }
        }
        if fmd.embedded {
            if let FieldValue::Embedded(image) = value {
                let child = self.materialize_embedded(handle, field, image)?;
                return Ok(FieldValue::Ref(ObjectRef::Managed(child)));
            }
        }
        if holds_identity_tokens(&value) {
            let label = self.state_manager(handle)?.describe();
            value = value.try_map_refs(&mut |r| match r {
                ObjectRef::Id(id) => match self.find_object(&id, false) {
                    Ok(target) => Ok(FieldValue::Ref(ObjectRef::Managed(target))),
                    Err(e) if e.is_not_found() && source != ValueSource::Cache => {
                        log::warn!(
                            "{}.{} references {} which no longer exists",
                            label,
                            fmd.name,
                            id
                        );
                        Ok(FieldValue::Null)
                    }
                    Err(e) => Err(e),
                },
                other => Ok(FieldValue::Ref(other)),
            })?;
        }
        Ok(self.types().wrap_value(fmd.field_type, value))
    }

    /// Take an object out of the context. Its embedded children go with it,
    /// tracked containers are released and the instance loses its back-link.
    pub(crate) fn remove_object(&mut self, handle: ObjectHandle) -> Result<Box<dyn crate::state::Persistable>> {
        let (id, count) = {
            let sm = self.state_manager(handle)?;
            (sm.id.clone(), sm.class.field_count())
        };
        if let Some(id) = id {
            if self.l1.get(&id) == Some(&handle) {
                self.l1.remove(&id);
            }
        }
        if self.dirty_set.remove(&handle) {
            self.dirty.retain(|h| *h != handle);
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.evict(handle);
        }
        if let Some(rm) = self.relationships.as_mut() {
            rm.forget(handle);
        }
        for child in self.arena.embedded_children(handle) {
            if self.arena.contains(child) {
                self.remove_object(child)?;
            }
        }

        let all: Vec<usize> = (0..count).collect();
        let mut releaser = UnsetOwnerFieldManager::new(handle);
        self.provide_fields(handle, &all, &mut releaser)?;

        let mut slot = self.arena.remove(handle)?;
        slot.object.state_slot_mut().clear_engine();
        event!(
            Level::DEBUG,
            object = %slot.sm.describe(),
            released = releaser.released(),
            "object left context"
        );
        Ok(slot.object)
    }

    // ------------------------------------------------------------------
    // Operation scoping
    // ------------------------------------------------------------------

    /// Run a multi-step operation. Datastore work it causes is sent when the
    /// outermost operation completes.
    pub(crate) fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        let value = result?;
        self.after_operation()?;
        Ok(value)
    }

    /// Outside a transaction changes are flushed and settled at once; in a
    /// datastore transaction without delayed operations they are flushed.
    pub(crate) fn after_operation(&mut self) -> Result<()> {
        if self.batch_depth > 0 || self.flushing {
            return Ok(());
        }
        if !self.is_transaction_active() {
            self.process_nontransactional_update()
        } else if !self.config.delays_datastore_operations() {
            self.flush_all().map(|_| ())
        } else {
            Ok(())
        }
    }
}
