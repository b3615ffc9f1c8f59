//! Field mediation: every read and write of a managed field goes through here.

use super::FieldSelector;
use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldBitSet, FieldValue, FromFieldValue, ObjectHandle, PersistenceError, Result};
use crate::fieldmanager::{FieldManager, PersistFieldManager};
use crate::state::{LifecycleEvent, LifecycleStage, Persistable};
use crate::types::OwnerLink;
use crate::types::tracked::tracked_owner;
use paste::paste;

macro_rules! typed_accessors {
    ($($name:ident: $ty:ty => $variant:ident),* $(,)?) => {
        paste! {
            $(
                pub fn [<get_ $name _field>](
                    &mut self,
                    handle: ObjectHandle,
                    field: impl FieldSelector,
                ) -> Result<$ty> {
                    <$ty>::from_field_value(self.get_field(handle, field)?)
                }

                pub fn [<set_ $name _field>](
                    &mut self,
                    handle: ObjectHandle,
                    field: impl FieldSelector,
                    value: $ty,
                ) -> Result<()> {
                    self.set_field(handle, field, FieldValue::$variant(value))
                }
            )*
        }
    };
}

impl ExecutionContext {
    /// Value of `field`, loading it first when it is not in memory
    pub fn get_field(&mut self, handle: ObjectHandle, field: impl FieldSelector) -> Result<FieldValue> {
        let slot = self.arena.get(handle)?;
        let field = field.resolve(&slot.sm.class)?;
        if slot.sm.is_loaded_fast(field) {
            return Ok(slot.object.provide_field(field));
        }
        self.load_for_read(handle, field)?;
        Ok(self.arena.get(handle)?.object.provide_field(field))
    }

    fn load_for_read(&mut self, handle: ObjectHandle, field: usize) -> Result<()> {
        let sm = self.state_manager(handle)?;
        if let Some(before) = &sm.pre_delete_loaded {
            if before.get(field) {
                return Ok(());
            }
            return Err(PersistenceError::FieldNotAvailable {
                object: sm.describe(),
                field: sm.field_label(field),
            });
        }
        if sm.stage.is_deleted() {
            return Err(PersistenceError::ObjectDeleted(sm.describe()));
        }
        if sm.is_embedded() || !sm.stage.is_persistent() || sm.id.is_none() {
            self.sm_mut(handle)?.loaded.set(field);
            return Ok(());
        }
        self.ensure_open()?;
        if !self.is_transaction_active() && !self.config.nontransactional_read {
            return Err(PersistenceError::Transaction(format!(
                "Reading field '{}' of {} requires an active transaction",
                sm.field_label(field),
                sm.describe()
            )));
        }

        let plan = self.fetch_plan.fields_for(&sm.class);
        let mut scope = if plan.get(field) {
            plan.difference(&sm.loaded)
        } else {
            FieldBitSet::new(sm.class.field_count())
        };
        scope.set(field);
        self.ensure_loaded(handle, &scope)
    }

    /// Load whatever of `wanted` is not in memory yet. A hollow object
    /// becomes clean; completing the default fetch group fires post-load.
    pub(crate) fn ensure_loaded(&mut self, handle: ObjectHandle, wanted: &FieldBitSet) -> Result<()> {
        let sm = self.state_manager(handle)?;
        let missing = wanted.difference(&sm.loaded);
        if missing.is_empty() || sm.id.is_none() {
            return Ok(());
        }
        let dfg_was_complete = sm.unloaded_dfg_fields().is_empty();
        let fields = missing.fields();
        self.changing_state(handle, |ctx| ctx.load_fields(handle, &fields))?;
        self.sm_mut(handle)?.loaded.union_with(&missing);

        if self.stage(handle)? == LifecycleStage::Hollow {
            self.transition_object(handle, LifecycleEvent::ReadField { loaded: false })?;
        }
        self.enlist(handle)?;
        if !dfg_was_complete && self.state_manager(handle)?.unloaded_dfg_fields().is_empty() {
            self.post_load(handle)?;
        }
        Ok(())
    }

    /// Write `field` of a managed object.
    ///
    /// The new value is made reachable (transient referents become
    /// persistent, embedded values become owned objects), installed, and the
    /// field marked dirty. Relation changes are recorded for the
    /// relationship manager and an embedded object dirties its owner field.
    pub fn set_field(
        &mut self,
        handle: ObjectHandle,
        field: impl FieldSelector,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        self.ensure_open()?;
        let value = value.into();
        let sm = self.state_manager(handle)?;
        let class = sm.class.clone();
        let field = field.resolve(&class)?;
        let fmd = class.fields[field].clone();
        let stage = sm.stage;
        let embedded_owner = sm.embedded_owner;
        let inserting = sm.activity.is_inserting();
        let detaching = sm.is_detaching();
        let transient_clean = stage == LifecycleStage::TransientClean;

        if stage.is_deleted() {
            return Err(PersistenceError::ObjectDeleted(sm.describe()));
        }
        if !inserting
            && !transient_clean
            && !self.is_transaction_active()
            && !self.config.nontransactional_write
        {
            return Err(PersistenceError::Transaction(format!(
                "Writing field '{}' of {} requires an active transaction",
                fmd.name,
                sm.describe()
            )));
        }

        let mut rekey = false;
        if fmd.primary_key {
            let current = self.arena.get(handle)?.object.provide_field(field);
            if current != value {
                let sm = self.state_manager(handle)?;
                if stage != LifecycleStage::PersistentNew || sm.flags.flushed_new {
                    return Err(PersistenceError::IdentityChange {
                        object: sm.describe(),
                        field: fmd.name.to_string(),
                    });
                }
                rekey = true;
            }
        }

        // The old value of a relation is needed to work out what changed
        let sm = self.state_manager(handle)?;
        if fmd.is_relation() && !stage.is_new() && !sm.loaded.get(field) && sm.id.is_some() {
            self.changing_state(handle, |ctx| ctx.load_fields(handle, &[field]))?;
            self.sm_mut(handle)?.loaded.set(field);
        }

        if let Some(link) = tracked_owner(&value) {
            if link != (OwnerLink { object: handle, field }) && self.arena.contains(link.object) {
                let owner = self.state_manager(link.object)?;
                return Err(PersistenceError::OwnershipConflict {
                    object: self.state_manager(handle)?.describe(),
                    field: fmd.name.to_string(),
                    owner: format!("{}.{}", owner.describe(), owner.field_label(link.field)),
                });
            }
        }

        // Writes made while the object is being inserted settle into the
        // inserted state
        if inserting {
            let value = self.reach_value(handle, field, value)?;
            self.install_field(handle, field, value)?;
            if rekey {
                self.rekey_application_identity(handle)?;
            }
            return Ok(());
        }

        // Writes made while the object is being detached reach the copy but
        // leave the managed object clean
        if detaching {
            let value = if fmd.is_relation() {
                self.reach_value(handle, field, value)?
            } else {
                self.types().wrap_value(fmd.field_type, value)
            };
            self.install_field(handle, field, value)?;
            return Ok(());
        }

        if let Some(owner) = embedded_owner {
            self.enlist(owner.owner)?;
        }
        let first_dirty = matches!(stage, LifecycleStage::PersistentClean | LifecycleStage::Hollow);
        if first_dirty {
            self.fire(handle, CallbackEvent::PreDirty)?;
        }
        self.enlist(handle)?;
        self.transition_object(handle, LifecycleEvent::WriteField)?;

        let value = if transient_clean {
            self.types().wrap_value(fmd.field_type, value)
        } else {
            self.reach_value(handle, field, value)?
        };
        let old = self.install_field(handle, field, value)?;
        if !transient_clean {
            self.sm_mut(handle)?.dirty.set(field);
        }
        if first_dirty {
            self.fire(handle, CallbackEvent::PostDirty)?;
        }

        let new = self.arena.get(handle)?.object.provide_field(field);
        if old != new {
            if fmd.is_relation() && !fmd.embedded {
                if let Some(rm) = self.relationships.as_mut() {
                    rm.record(handle, field, &old, &new);
                }
            }
            if fmd.dependent && !fmd.embedded {
                let kept = new.referenced_handles();
                for orphan in old.referenced_handles() {
                    let live = self.state_manager(orphan).is_ok_and(|s| !s.is_deleted());
                    if !kept.contains(&orphan) && live {
                        self.delete_persistent(orphan)?;
                    }
                }
            }
            if let Some(owner) = embedded_owner {
                self.mark_field_dirty(owner.owner, owner.field)?;
            }
        }
        if rekey {
            self.rekey_application_identity(handle)?;
        }
        if !transient_clean && embedded_owner.is_none() {
            self.mark_dirty_list(handle);
        }
        self.after_operation()
    }

    /// Write `field` of an instance the caller holds. A clone of a managed
    /// instance is not the managed object: the value goes into the clone as
    /// a plain replace and the clone loses its back-link.
    pub fn set_instance_field(
        &mut self,
        object: &mut dyn Persistable,
        field: impl FieldSelector,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        let class = self.registry.metadata(object.class_name())?;
        let field = field.resolve(&class)?;
        let value = value.into();
        if let Some(key) = object.state_slot().engine_key() {
            let owning = key.context() == self.id
                && self
                    .arena
                    .get(key.handle())
                    .is_ok_and(|slot| slot.sm.instance == object.state_slot().instance_id());
            if owning {
                return self.set_field(key.handle(), field, value);
            }
            log::debug!(
                "Write to field '{}' of a non-owning {} copy; detaching it from {}",
                class.field_name(field),
                class.name,
                key.handle()
            );
            object.state_slot_mut().clear_engine();
        }
        object.replace_field(field, value)
    }

    typed_accessors!(
        boolean: bool => Boolean,
        byte: i8 => Byte,
        char: char => Char,
        short: i16 => Short,
        int: i32 => Int,
        long: i64 => Long,
        float: f32 => Float,
        double: f64 => Double,
        string: String => Text,
    );

    /// Run `value` through persistence by reachability for `field`
    fn reach_value(&mut self, handle: ObjectHandle, field: usize, value: FieldValue) -> Result<FieldValue> {
        let mut reach = PersistFieldManager::new(self, handle);
        reach.store_field(field, value)?;
        reach.fetch_field(field)
    }

    /// A new object with application identity follows its primary key
    fn rekey_application_identity(&mut self, handle: ObjectHandle) -> Result<()> {
        let class = self.class_of(handle)?;
        if class.identity != crate::metadata::IdentityStrategy::Application {
            return Ok(());
        }
        let keys: Vec<FieldValue> = self
            .field_values(handle, class.primary_key_fields())?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let id = class.identity_from_keys(&keys)?;
        if self.state_manager(handle)?.id.as_ref() == Some(&id) {
            return Ok(());
        }
        if self.handle_of(&id).is_some_and(|other| other != handle) {
            return Err(PersistenceError::DuplicateObject(id.to_string()));
        }
        if let Some(old) = self.sm_mut(handle)?.id.take() {
            self.l1.remove(&old);
        }
        self.sm_mut(handle)?.id = Some(id.clone());
        self.l1_put(id, handle)
    }

    /// Flag `field` as changed in place, e.g. after mutating a container
    /// obtained from the object
    pub fn make_dirty(&mut self, handle: ObjectHandle, field: impl FieldSelector) -> Result<()> {
        self.ensure_open()?;
        let field = field.resolve(self.class_of(handle)?.as_ref())?;
        self.mark_field_dirty(handle, field)?;
        self.after_operation()
    }

    pub(crate) fn mark_field_dirty(&mut self, handle: ObjectHandle, field: usize) -> Result<()> {
        let sm = self.state_manager(handle)?;
        if let Some(owner) = sm.embedded_owner {
            return self.mark_field_dirty(owner.owner, owner.field);
        }
        if sm.activity.is_inserting()
            || sm.is_deleted()
            || matches!(sm.stage, LifecycleStage::Transient | LifecycleStage::TransientClean)
        {
            return Ok(());
        }
        let first_dirty = matches!(sm.stage, LifecycleStage::PersistentClean | LifecycleStage::Hollow);
        if first_dirty {
            self.fire(handle, CallbackEvent::PreDirty)?;
        }
        self.enlist(handle)?;
        self.transition_object(handle, LifecycleEvent::WriteField)?;
        let sm = self.sm_mut(handle)?;
        sm.loaded.set(field);
        sm.dirty.set(field);
        if first_dirty {
            self.fire(handle, CallbackEvent::PostDirty)?;
        }
        self.mark_dirty_list(handle);
        Ok(())
    }

    /// The managed instance with its fetch-plan fields loaded
    pub fn object<T: Persistable>(&mut self, handle: ObjectHandle) -> Result<&T> {
        let sm = self.state_manager(handle)?;
        if sm.stage.is_persistent() && !sm.stage.is_deleted() {
            let wanted = self.fetch_plan.fields_for(&sm.class);
            self.ensure_loaded(handle, &wanted)?;
        }
        let slot = self.arena.get(handle)?;
        slot.object.downcast_ref::<T>().ok_or_else(|| {
            PersistenceError::type_mismatch(std::any::type_name::<T>(), slot.sm.class.name)
        })
    }
}
