//! Making objects persistent: identity assignment, value strategies,
//! persistence by reachability and embedded objects.

use super::{DetachedGraph, ValueSource, access_flags_for};
use crate::context::{CallbackEvent, ExecutionContext, ManagedSlot};
use crate::core::{
    EmbeddedValue, FieldType, FieldValue, KeyValue, ObjectHandle, ObjectId, PersistenceError, Result,
};
use crate::fieldmanager::{FieldManager, PersistFieldManager};
use crate::metadata::{ClassMetadata, IdentityStrategy, ValueStrategy};
use crate::state::{
    EmbeddedOwner, EngineKey, LifecycleEvent, LifecycleStage, Persistable, StateManager,
};
use crate::types::OwnerLink;
use crate::types::tracked::{set_tracked_owner, tracked_owner};
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

fn is_zero(value: &FieldValue) -> bool {
    matches!(
        value,
        FieldValue::Long(0) | FieldValue::Int(0) | FieldValue::Short(0) | FieldValue::Byte(0)
    )
}

fn sequence_value(field_type: FieldType, next: i64, field: &str) -> Result<FieldValue> {
    let out_of_range = || {
        PersistenceError::User(format!(
            "Sequence value {} does not fit field '{}'",
            next, field
        ))
    };
    Ok(match field_type {
        FieldType::Int => FieldValue::Int(i32::try_from(next).map_err(|_| out_of_range())?),
        FieldType::Short => FieldValue::Short(i16::try_from(next).map_err(|_| out_of_range())?),
        FieldType::Text => FieldValue::Text(next.to_string()),
        _ => FieldValue::Long(next),
    })
}

impl ExecutionContext {
    /// Make a transient object persistent, together with every transient
    /// object reachable from it. Returns the handle of the managed object.
    pub fn make_persistent<T: Persistable>(&mut self, object: T) -> Result<ObjectHandle> {
        self.make_persistent_boxed(Box::new(object))
    }

    pub fn make_persistent_all(
        &mut self,
        objects: Vec<Box<dyn Persistable>>,
    ) -> Result<Vec<ObjectHandle>> {
        self.batch(|ctx| {
            objects
                .into_iter()
                .map(|object| ctx.make_persistent_boxed(object))
                .collect()
        })
    }

    pub fn make_persistent_boxed(&mut self, mut object: Box<dyn Persistable>) -> Result<ObjectHandle> {
        self.ensure_open()?;
        if let Some(key) = object.state_slot().engine_key() {
            if key.context() != self.id {
                return Err(PersistenceError::ForeignContext(format!(
                    "{} (context {})",
                    object.class_name(),
                    key.context()
                )));
            }
            if self.arena.contains(key.handle()) {
                let handle = key.handle();
                return self.batch(|ctx| {
                    ctx.make_persistent_handle(handle)?;
                    Ok(handle)
                });
            }
            // A copy of an instance that has left this context
            object.state_slot_mut().clear_engine();
        }
        if object.state_slot().is_detached() {
            let class = self.registry.metadata(object.class_name())?;
            let graph = DetachedGraph::single(object, class)?;
            return self.attach_copy(&graph);
        }
        if !self.is_transaction_active() && !self.config.nontransactional_write {
            return Err(PersistenceError::Transaction(format!(
                "Making a {} persistent requires an active transaction",
                object.class_name()
            )));
        }
        self.batch(|ctx| ctx.persist_new(object, None))
    }

    /// Put a transient instance under management as persistent-new. `id` is
    /// used as its identity when given.
    pub(crate) fn persist_new(
        &mut self,
        mut object: Box<dyn Persistable>,
        id: Option<ObjectId>,
    ) -> Result<ObjectHandle> {
        let class = self.registry.metadata(object.class_name())?;
        for field in 0..class.field_count() {
            let value = object.provide_field(field);
            if let Some(link) = tracked_owner(&value) {
                if self.arena.contains(link.object) {
                    let owner = self.state_manager(link.object)?;
                    return Err(PersistenceError::OwnershipConflict {
                        object: format!("new {}", class.name),
                        field: class.field_name(field).to_string(),
                        owner: format!("{}.{}", owner.describe(), owner.field_label(link.field)),
                    });
                }
            }
        }

        object.state_slot_mut().set_detached(None);
        let handle = self.insert_managed(object, |h, instance| {
            StateManager::for_persistent_new(class.clone(), h, instance)
        });
        event!(Level::DEBUG, class = class.name, handle = %handle, "made persistent");

        if let Err(e) = self.initialize_new(handle, id) {
            if self.arena.contains(handle) {
                self.remove_object(handle)?;
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Place `object` in the arena under the state manager `make` builds
    pub(crate) fn insert_managed(
        &mut self,
        mut object: Box<dyn Persistable>,
        make: impl FnOnce(ObjectHandle, crate::state::InstanceId) -> StateManager,
    ) -> ObjectHandle {
        let instance = object.state_slot().instance_id();
        let context = self.id;
        self.arena.insert_with(|handle| {
            let sm = make(handle, instance);
            let slot = object.state_slot_mut();
            slot.set_engine(EngineKey { context, handle });
            slot.set_flags(access_flags_for(sm.stage));
            ManagedSlot { sm, object }
        })
    }

    fn initialize_new(&mut self, handle: ObjectHandle, id: Option<ObjectId>) -> Result<()> {
        let class = self.class_of(handle)?;
        self.apply_value_strategies(handle, &class)?;

        let id = match id {
            Some(id) => Some(id),
            None => self.new_identity(handle, &class)?,
        };
        if let Some(id) = id {
            if self.handle_of(&id).is_some_and(|other| other != handle) {
                return Err(PersistenceError::DuplicateObject(id.to_string()));
            }
            self.sm_mut(handle)?.id = Some(id.clone());
            self.l1_put(id, handle)?;
        }

        self.adopt_containers(handle)?;
        self.fire(handle, CallbackEvent::Create)?;
        self.enlist(handle)?;
        self.mark_dirty_list(handle);
        self.reach_fields(handle)
    }

    fn apply_value_strategies(&mut self, handle: ObjectHandle, class: &ClassMetadata) -> Result<()> {
        for fmd in &class.fields {
            let Some(strategy) = fmd.value_strategy else {
                continue;
            };
            let current = self.arena.get(handle)?.object.provide_field(fmd.number);
            let value = match strategy {
                ValueStrategy::Uuid if current.is_null() => match fmd.field_type {
                    FieldType::Text => FieldValue::Text(Uuid::new_v4().to_string()),
                    _ => FieldValue::Uuid(Uuid::new_v4()),
                },
                ValueStrategy::Sequence if current.is_null() || is_zero(&current) => {
                    let next = self.handler.next_sequence_value(class.name, fmd.name)?;
                    sequence_value(fmd.field_type, next, fmd.name)?
                }
                _ => continue,
            };
            self.arena.get_mut(handle)?.object.replace_field(fmd.number, value)?;
        }
        Ok(())
    }

    /// Identity known before the object reaches the datastore; native
    /// identity is assigned by the datastore at insert
    fn new_identity(&mut self, handle: ObjectHandle, class: &ClassMetadata) -> Result<Option<ObjectId>> {
        match class.identity {
            IdentityStrategy::Application => {
                let keys: Vec<FieldValue> = self
                    .field_values(handle, class.primary_key_fields())?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect();
                class.identity_from_keys(&keys).map(Some)
            }
            IdentityStrategy::Uuid => {
                let slot = self.arena.get_mut(handle)?;
                let pk = class.primary_key_fields().first().copied();
                let existing = pk.map(|f| slot.object.provide_field(f));
                let key = match existing {
                    Some(FieldValue::Uuid(u)) if !u.is_nil() => u,
                    _ => Uuid::new_v4(),
                };
                if let Some(pk) = pk {
                    slot.object.replace_field(pk, FieldValue::Uuid(key))?;
                }
                Ok(Some(ObjectId::new(class.name, KeyValue::Uuid(key))))
            }
            IdentityStrategy::Native => Ok(None),
        }
    }

    /// Containers become tracked wrappers owned by their field
    pub(super) fn adopt_containers(&mut self, handle: ObjectHandle) -> Result<()> {
        let class = self.class_of(handle)?;
        let slot = self.arena.get_mut(handle)?;
        let types = self.registry.type_registry();
        for fmd in class.fields.iter().filter(|f| f.field_type.is_container()) {
            let value = slot.object.provide_field(fmd.number);
            let wrapped = types.wrap_value(fmd.field_type, value);
            if matches!(wrapped, FieldValue::TrackedList(_) | FieldValue::TrackedMap(_)) {
                set_tracked_owner(
                    &wrapped,
                    OwnerLink { object: handle, field: fmd.number },
                    &self.containers,
                );
                slot.object.replace_field(fmd.number, wrapped)?;
            }
        }
        Ok(())
    }

    /// Persistence by reachability over every field that can hold objects.
    /// The references found are also recorded as relation changes.
    fn reach_fields(&mut self, handle: ObjectHandle) -> Result<()> {
        let class = self.class_of(handle)?;
        let slot = self.arena.get(handle)?;
        let candidates: Vec<usize> = class
            .fields
            .iter()
            .filter(|f| {
                let value = slot.object.provide_field(f.number);
                f.is_relation() || value.contains_owned_refs() || !value.referenced_handles().is_empty()
            })
            .map(|f| f.number)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let values = self.field_values(handle, &candidates)?;
        let mut reach = PersistFieldManager::new(self, handle);
        for (field, value) in values {
            reach.store_field(field, value)?;
        }
        for (field, value) in reach.into_results() {
            self.install_field(handle, field, value)?;
            let fmd = &class.fields[field];
            if fmd.is_relation() && !fmd.embedded {
                let current = self.arena.get(handle)?.object.provide_field(field);
                if let Some(rm) = self.relationships.as_mut() {
                    rm.record(handle, field, &FieldValue::Null, &current);
                }
            }
        }
        Ok(())
    }

    /// Promote an object registered only as transactional; managed objects
    /// in any other stage are left as they are.
    pub(crate) fn make_persistent_handle(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.state_manager(handle)?;
        if sm.stage != LifecycleStage::TransientClean || sm.is_embedded() {
            return Ok(());
        }
        self.transition_object(handle, LifecycleEvent::MakePersistent)?;
        self.initialize_new(handle, None)
    }

    fn embedded_stage(&self, owner: ObjectHandle) -> Result<LifecycleStage> {
        Ok(match self.stage(owner)? {
            s if s.is_new() => LifecycleStage::PersistentNew,
            LifecycleStage::TransientClean => LifecycleStage::TransientClean,
            _ => LifecycleStage::PersistentClean,
        })
    }

    fn insert_embedded(
        &mut self,
        owner: ObjectHandle,
        field: usize,
        class: Arc<ClassMetadata>,
        mut object: Box<dyn Persistable>,
    ) -> Result<ObjectHandle> {
        let stage = self.embedded_stage(owner)?;
        object.state_slot_mut().clear_engine();
        object.state_slot_mut().set_detached(None);
        let link = EmbeddedOwner { owner, field };
        Ok(self.insert_managed(object, |h, instance| {
            StateManager::for_embedded(class, h, instance, link, stage)
        }))
    }

    /// Manage `object` as the embedded value of `field` of `owner`
    pub(crate) fn make_embedded(
        &mut self,
        owner: ObjectHandle,
        field: usize,
        object: Box<dyn Persistable>,
    ) -> Result<ObjectHandle> {
        let class = self.registry.metadata(object.class_name())?;
        let child = self.insert_embedded(owner, field, class, object)?;
        self.adopt_containers(child)?;
        self.reach_fields(child)?;
        Ok(child)
    }

    /// Build the embedded object of `field` of `owner` from its inline image
    pub(crate) fn materialize_embedded(
        &mut self,
        owner: ObjectHandle,
        field: usize,
        image: EmbeddedValue,
    ) -> Result<ObjectHandle> {
        let class = self.registry.metadata(image.class)?;
        let object = self.registry.new_instance(image.class)?;
        let count = class.field_count();
        let child = self.insert_embedded(owner, field, class, object)?;
        for (f, value) in image.fields.into_iter().enumerate().take(count) {
            let value = self.internalize_value(child, f, value, ValueSource::Embedded)?;
            self.install_field(child, f, value)?;
        }
        Ok(child)
    }
}
