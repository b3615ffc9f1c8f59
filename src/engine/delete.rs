//! Deleting persistent objects and the collection edits used by cascades
//! and relationship management.

use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldValue, ObjectHandle, PersistenceError, Result};
use crate::fieldmanager::{DeleteFieldManager, FieldManager};
use crate::state::{Activity, LifecycleEvent};
use tracing::{Level, event};

impl ExecutionContext {
    /// Delete a persistent object. Dependent referents are deleted with it
    /// and managed back-references to it are removed.
    pub fn delete_persistent(&mut self, handle: ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if sm.is_deleted() {
            return Ok(());
        }
        if sm.is_embedded() {
            return Err(PersistenceError::User(format!(
                "{} is embedded; delete its owner or clear the owning field",
                sm.describe()
            )));
        }
        self.check_transition(handle, LifecycleEvent::DeletePersistent)?;
        if !self.is_transaction_active() && !self.config.nontransactional_write {
            return Err(PersistenceError::Transaction(format!(
                "Deleting {} requires an active transaction",
                self.state_manager(handle)?.describe()
            )));
        }
        self.batch(|ctx| ctx.delete_internal(handle))
    }

    pub fn delete_persistent_all(&mut self, handles: &[ObjectHandle]) -> Result<()> {
        self.batch(|ctx| handles.iter().try_for_each(|h| ctx.delete_persistent(*h)))
    }

    fn delete_internal(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.state_manager(handle)?;
        let class = sm.class.clone();
        let relations: Vec<usize> = class
            .relation_fields()
            .fields()
            .into_iter()
            .filter(|f| !class.fields[*f].embedded)
            .collect();

        // Referents must be known to cascade over them
        if !sm.is_new() && sm.id.is_some() {
            let unloaded: Vec<usize> = relations
                .iter()
                .copied()
                .filter(|f| !sm.loaded.get(*f))
                .collect();
            if !unloaded.is_empty() {
                self.changing_state(handle, |ctx| ctx.load_fields(handle, &unloaded))?;
                let sm = self.sm_mut(handle)?;
                for f in unloaded {
                    sm.loaded.set(f);
                }
            }
        }
        self.fire(handle, CallbackEvent::PreDelete)?;

        self.sm_mut(handle)?.activity = Activity::Deleting;
        let values = self.field_values(handle, &relations)?;
        let cascade = {
            let mut cascade = DeleteFieldManager::new(self, handle)?;
            let result = values
                .into_iter()
                .try_for_each(|(field, value)| cascade.store_field(field, value));
            result.map(|_| cascade.cascaded())
        };
        self.sm_mut(handle)?.activity = Activity::None;
        let cascaded = cascade?;

        self.enlist(handle)?;
        self.transition_object(handle, LifecycleEvent::DeletePersistent)?;
        let delayed = self.config.delays_datastore_operations() && self.is_transaction_active();
        let sm = self.sm_mut(handle)?;
        if delayed {
            sm.pre_delete_loaded = Some(sm.loaded.clone());
        }
        event!(Level::DEBUG, object = %sm.describe(), cascaded, "marked deleted");
        self.mark_dirty_list(handle);
        if let Some(rm) = self.relationships.as_mut() {
            rm.forget(handle);
        }
        Ok(())
    }

    /// Remove `value` from the collection in `field` of `handle`. Returns
    /// whether the collection held it.
    pub(crate) fn remove_from_collection(
        &mut self,
        handle: ObjectHandle,
        field: usize,
        value: &FieldValue,
    ) -> Result<bool> {
        match self.get_field(handle, field)? {
            FieldValue::TrackedList(list) => {
                if !list.contains(value) {
                    return Ok(false);
                }
                self.enlist(handle)?;
                list.remove_value(value);
                list.take_modified();
                self.mark_field_dirty(handle, field)?;
                Ok(true)
            }
            FieldValue::List(mut items) => {
                let before = items.len();
                items.retain(|v| v != value);
                if items.len() == before {
                    return Ok(false);
                }
                self.set_field(handle, field, FieldValue::List(items))?;
                Ok(true)
            }
            FieldValue::TrackedMap(map) => {
                let keys: Vec<String> = map
                    .entries()
                    .into_iter()
                    .filter(|(_, v)| v == value)
                    .map(|(k, _)| k)
                    .collect();
                if keys.is_empty() {
                    return Ok(false);
                }
                self.enlist(handle)?;
                for key in keys {
                    map.remove(&key);
                }
                map.take_modified();
                self.mark_field_dirty(handle, field)?;
                Ok(true)
            }
            FieldValue::Map(mut entries) => {
                let before = entries.len();
                entries.retain(|_, v| v != value);
                if entries.len() == before {
                    return Ok(false);
                }
                self.set_field(handle, field, FieldValue::Map(entries))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Append `value` to the collection in `field` of `handle` unless it is
    /// already there. Returns whether it was added.
    pub(crate) fn add_to_collection(
        &mut self,
        handle: ObjectHandle,
        field: usize,
        value: FieldValue,
    ) -> Result<bool> {
        match self.get_field(handle, field)? {
            FieldValue::TrackedList(list) => {
                if list.contains(&value) {
                    return Ok(false);
                }
                self.enlist(handle)?;
                list.push(value);
                list.take_modified();
                self.mark_field_dirty(handle, field)?;
                Ok(true)
            }
            FieldValue::List(mut items) => {
                if items.contains(&value) {
                    return Ok(false);
                }
                items.push(value);
                self.set_field(handle, field, FieldValue::List(items))?;
                Ok(true)
            }
            FieldValue::Null => {
                self.set_field(handle, field, FieldValue::List(vec![value]))?;
                Ok(true)
            }
            other => {
                log::warn!(
                    "Cannot add to field {} of {}: it holds {}",
                    self.state_manager(handle)?.field_label(field),
                    self.state_manager(handle)?.describe(),
                    other.type_name()
                );
                Ok(false)
            }
        }
    }
}
