// ============================================================================
// Detach
// ============================================================================
//
// Copies a managed object, and the objects it references within the fetch
// depth, out of the context. The copies form a DetachedGraph keyed by
// identity; references between them are identity tokens. Copies of
// detachable classes carry a DetachedState (identity, version, loaded and
// modified fields), which is what attach later merges back.
//
// ============================================================================

use super::FieldSelector;
use crate::config::DetachPolicy;
use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldBitSet, FieldValue, ObjectHandle, ObjectId, PersistenceError, Result};
use crate::fieldmanager::{DetachFieldManager, FieldManager};
use crate::metadata::ClassMetadata;
use crate::state::{DetachedState, LifecycleEvent, Persistable};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// Detached copies of an object graph
pub struct DetachedGraph {
    root: ObjectId,
    objects: BTreeMap<ObjectId, Box<dyn Persistable>>,
    classes: HashMap<&'static str, Arc<ClassMetadata>>,
}

impl DetachedGraph {
    /// Graph made of one detached instance
    pub(crate) fn single(object: Box<dyn Persistable>, class: Arc<ClassMetadata>) -> Result<Self> {
        let root = object
            .state_slot()
            .detached_state()
            .map(|d| d.object_id().clone())
            .ok_or_else(|| {
                PersistenceError::User(format!("{} instance is not detached", object.class_name()))
            })?;
        let mut objects = BTreeMap::new();
        objects.insert(root.clone(), object);
        let mut classes = HashMap::new();
        classes.insert(class.name, class);
        Ok(Self {
            root,
            objects,
            classes,
        })
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root
    }

    pub fn root<T: Persistable>(&self) -> Option<&T> {
        self.get(&self.root)
    }

    pub fn get<T: Persistable>(&self, id: &ObjectId) -> Option<&T> {
        self.objects.get(id)?.downcast_ref::<T>()
    }

    pub fn object(&self, id: &ObjectId) -> Option<&dyn Persistable> {
        self.objects.get(id).map(|o| o.as_ref())
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    fn resolve(&self, id: &ObjectId, field: impl FieldSelector) -> Result<usize> {
        let class = self
            .classes
            .get(id.class_name())
            .ok_or_else(|| PersistenceError::UnknownClass(id.class_name().to_string()))?;
        field.resolve(class)
    }

    /// Value of `field` of the copy `id`; fields that were not detached
    /// cannot be read
    pub fn get_field(&self, id: &ObjectId, field: impl FieldSelector) -> Result<FieldValue> {
        let field = self.resolve(id, field)?;
        let object = self
            .objects
            .get(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        if let Some(detached) = object.state_slot().detached_state() {
            if !detached.loaded_fields().get(field) {
                return Err(PersistenceError::DetachedFieldAccess {
                    object: id.to_string(),
                    field: self.classes[id.class_name()].field_name(field).to_string(),
                });
            }
        }
        Ok(object.provide_field(field))
    }

    /// Write `field` of the copy `id`; the change is merged on attach
    pub fn set_field(
        &mut self,
        id: &ObjectId,
        field: impl FieldSelector,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        let field = self.resolve(id, field)?;
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        object.replace_field(field, value.into())?;
        if let Some(detached) = object.state_slot_mut().detached_mut() {
            detached.modified.set(field);
            detached.loaded.set(field);
        }
        Ok(())
    }

    /// The root copy, taken out of the graph
    pub fn into_root<T: Persistable>(mut self) -> Result<T> {
        let object = self
            .objects
            .remove(&self.root)
            .ok_or_else(|| PersistenceError::ObjectNotFound(self.root.to_string()))?;
        let class = object.class_name();
        object
            .downcast::<T>()
            .map(|b| *b)
            .ok_or_else(|| PersistenceError::type_mismatch(std::any::type_name::<T>(), class))
    }
}

impl Clone for DetachedGraph {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            objects: self
                .objects
                .iter()
                .map(|(id, o)| (id.clone(), o.clone_boxed()))
                .collect(),
            classes: self.classes.clone(),
        }
    }
}

impl fmt::Debug for DetachedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedGraph")
            .field("root", &self.root)
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Progress of one detach operation; an object met twice is copied once
#[derive(Debug, Default)]
pub struct DetachState {
    visited: HashMap<ObjectHandle, ObjectId>,
    objects: BTreeMap<ObjectId, Box<dyn Persistable>>,
    classes: HashMap<&'static str, Arc<ClassMetadata>>,
}

impl ExecutionContext {
    /// Detached copy of `handle` and the objects it reaches within the fetch
    /// depth. The originals stay managed.
    pub fn detach_copy(&mut self, handle: ObjectHandle) -> Result<DetachedGraph> {
        self.detach_graph(handle).map(|(graph, _)| graph)
    }

    /// Like `detach_copy`, and the originals leave the context
    pub fn detach(&mut self, handle: ObjectHandle) -> Result<DetachedGraph> {
        let (graph, visited) = self.detach_graph(handle)?;
        for h in visited {
            if self.arena.contains(h) {
                self.transition_object(h, LifecycleEvent::Detach)?;
                self.remove_object(h)?;
            }
        }
        Ok(graph)
    }

    fn detach_graph(&mut self, handle: ObjectHandle) -> Result<(DetachedGraph, Vec<ObjectHandle>)> {
        self.ensure_open()?;
        let span = info_span!("detach", handle = %handle);
        let _enter = span.enter();
        self.flush_all()?;

        let mut state = DetachState::default();
        let root = self.detach_object(handle, 0, &mut state)?;
        event!(Level::DEBUG, root = %root, objects = state.objects.len(), "detached");
        let visited = state.visited.keys().copied().collect();
        Ok((
            DetachedGraph {
                root,
                objects: state.objects,
                classes: state.classes,
            },
            visited,
        ))
    }

    /// Copy `handle` into `state`, returning its identity. `depth` is the
    /// number of references followed to get here.
    pub(crate) fn detach_object(
        &mut self,
        handle: ObjectHandle,
        depth: i32,
        state: &mut DetachState,
    ) -> Result<ObjectId> {
        if let Some(id) = state.visited.get(&handle) {
            return Ok(id.clone());
        }
        let sm = self.state_manager(handle)?;
        let id = sm.id.clone().ok_or_else(|| {
            PersistenceError::User(format!("{} has no identity and cannot be detached", sm.describe()))
        })?;
        let class = sm.class.clone();
        self.check_transition(handle, LifecycleEvent::Detach)?;
        state.visited.insert(handle, id.clone());
        state.classes.entry(class.name).or_insert_with(|| class.clone());

        self.sm_mut(handle)?.flags.detaching = true;
        let copy = self.detach_fields(handle, &id, depth, state, &class);
        if let Ok(sm) = self.sm_mut(handle) {
            sm.flags.detaching = false;
        }
        state.objects.insert(id.clone(), copy?);
        self.fire(handle, CallbackEvent::PostDetach)?;
        Ok(id)
    }

    fn detach_fields(
        &mut self,
        handle: ObjectHandle,
        id: &ObjectId,
        depth: i32,
        state: &mut DetachState,
        class: &Arc<ClassMetadata>,
    ) -> Result<Box<dyn Persistable>> {
        self.fire(handle, CallbackEvent::PreDetach)?;
        let fields = self.detach_selection(handle, class)?;
        let values = self.field_values(handle, &fields)?;
        let (copied, boundary) = {
            let mut detacher = DetachFieldManager::new(self, state, class.clone(), depth);
            for (field, value) in values {
                detacher.store_field(field, value)?;
            }
            detacher.finish()
        };
        if !boundary.is_empty() {
            event!(
                Level::TRACE,
                object = %id,
                fields = ?boundary.fields(),
                "fetch depth boundary"
            );
        }

        let slot = self.arena.get(handle)?;
        let mut copy = slot.object.new_instance();
        let mut loaded = FieldBitSet::new(class.field_count());
        for &pk in class.primary_key_fields() {
            copy.replace_field(pk, slot.object.provide_field(pk))?;
            loaded.set(pk);
        }
        for (field, value) in copied {
            copy.replace_field(field, value)?;
            loaded.set(field);
        }
        if class.detachable {
            let detached = DetachedState::new(id.clone(), slot.sm.version.clone(), loaded);
            copy.state_slot_mut().set_detached(Some(detached));
        }
        Ok(copy)
    }

    /// Fields copied into a detached object, per the detach policy
    fn detach_selection(&mut self, handle: ObjectHandle, class: &ClassMetadata) -> Result<Vec<usize>> {
        let policy = self.config.detach_state;
        let plan = self.fetch_plan.fields_for(class);
        let wanted = match policy {
            DetachPolicy::All => class.all_fields(),
            DetachPolicy::Loaded => self.state_manager(handle)?.loaded.clone(),
            DetachPolicy::FetchGroups => plan,
        };
        if policy == DetachPolicy::All || self.config.detach_load_fields {
            self.ensure_loaded(handle, &wanted)?;
        }
        let loaded = self.state_manager(handle)?.loaded.clone();
        let mut selected = wanted;
        if policy == DetachPolicy::FetchGroups && !self.config.detach_unload_fields {
            selected.union_with(&loaded);
        }
        selected.intersect_with(&loaded);
        for &pk in class.primary_key_fields() {
            selected.clear(pk);
        }
        Ok(selected.fields())
    }

    /// Inline copy of an embedded object, for its owner's detached copy
    pub(crate) fn detach_embedded(
        &mut self,
        child: ObjectHandle,
        depth: i32,
        state: &mut DetachState,
    ) -> Result<Box<dyn Persistable>> {
        let class = self.class_of(child)?;
        let fields: Vec<usize> = (0..class.field_count()).collect();
        let values = self.field_values(child, &fields)?;
        let (copied, _) = {
            let mut detacher = DetachFieldManager::new(self, state, class.clone(), depth);
            for (field, value) in values {
                detacher.store_field(field, value)?;
            }
            detacher.finish()
        };
        let mut copy = self.arena.get(child)?.object.new_instance();
        for (field, value) in copied {
            copy.replace_field(field, value)?;
        }
        Ok(copy)
    }
}
