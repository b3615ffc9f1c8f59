//! Attaching detached graphs back into a context.
//!
//! A detached copy whose identity exists in the datastore is merged into
//! the managed object: every field it carries, loaded or modified, is
//! compared with the managed value and written when different. A copy with
//! no counterpart is replicated as a new persistent object.

use super::{DetachedGraph, holds_identity_tokens};
use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldValue, ObjectHandle, ObjectId, PersistenceError, Result};
use crate::fieldmanager::{AttachFieldManager, FieldManager};
use crate::state::{DetachedState, LifecycleEvent};
use std::collections::HashMap;
use tracing::{Level, event, info_span};

fn plain(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::TrackedList(list) => FieldValue::List(list.values()),
        FieldValue::TrackedMap(map) => FieldValue::Map(map.entries()),
        other => other,
    }
}

impl ExecutionContext {
    /// Attach the graph and return the handle of its root
    pub fn attach_copy(&mut self, graph: &DetachedGraph) -> Result<ObjectHandle> {
        self.ensure_open()?;
        if !self.is_transaction_active() && !self.config.nontransactional_write {
            return Err(PersistenceError::Transaction(format!(
                "Attaching {} requires an active transaction",
                graph.root_id()
            )));
        }
        let span = info_span!("attach", root = %graph.root_id());
        let _enter = span.enter();
        self.batch(|ctx| {
            let mut visited = HashMap::new();
            let root = ctx.attach_object(graph, graph.root_id(), &mut visited)?;
            event!(Level::DEBUG, objects = visited.len(), "attached");
            Ok(root)
        })
    }

    /// Attach the copy `id` of `graph`; `visited` maps the copies already
    /// attached in this operation to their managed objects
    pub(crate) fn attach_object(
        &mut self,
        graph: &DetachedGraph,
        id: &ObjectId,
        visited: &mut HashMap<ObjectId, ObjectHandle>,
    ) -> Result<ObjectHandle> {
        if let Some(handle) = visited.get(id) {
            return Ok(*handle);
        }
        let object = graph
            .object(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        let Some(detached) = object.state_slot().detached_state().cloned() else {
            return self.replicate(graph, id, visited);
        };

        let existing = match self.handle_of(id) {
            Some(handle) => Some(handle),
            None => match self.find_object(id, !self.config.attach_same_datastore) {
                Ok(handle) => Some(handle),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
        };
        match existing {
            Some(handle) => {
                self.check_transition(handle, LifecycleEvent::Attach)?;
                visited.insert(id.clone(), handle);
                {
                    let sm = self.sm_mut(handle)?;
                    sm.flags.attaching = true;
                    sm.attached_from = Some(id.clone());
                }
                let merged = self.merge_detached(graph, id, handle, &detached, visited);
                if let Ok(sm) = self.sm_mut(handle) {
                    sm.flags.attaching = false;
                    sm.attached_from = None;
                }
                merged?;
                Ok(handle)
            }
            None => self.replicate(graph, id, visited),
        }
    }

    fn merge_detached(
        &mut self,
        graph: &DetachedGraph,
        id: &ObjectId,
        handle: ObjectHandle,
        detached: &DetachedState,
        visited: &mut HashMap<ObjectId, ObjectHandle>,
    ) -> Result<()> {
        let class = self.class_of(handle)?;
        if class.is_versioned() {
            if let Some(version) = detached.version() {
                self.sm_mut(handle)?.version = Some(version.clone());
            }
        }
        self.fire(handle, CallbackEvent::PreAttach)?;

        let mut carried = detached.loaded_fields().clone();
        carried.union_with(detached.modified_fields());
        let fields: Vec<usize> = carried
            .fields()
            .into_iter()
            .filter(|&f| {
                let fmd = &class.fields[f];
                !fmd.primary_key
                    && class.version_field() != Some(f)
                    && (!fmd.embedded || detached.modified_fields().get(f))
            })
            .collect();

        let values = {
            let object = graph
                .object(id)
                .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
            fields
                .iter()
                .map(|&f| (f, object.provide_field(f)))
                .collect::<Vec<_>>()
        };
        let resolved = {
            let mut attacher = AttachFieldManager::new(self, graph, visited);
            for (field, value) in values {
                attacher.store_field(field, value)?;
            }
            attacher.into_results()
        };

        let mut changed = 0;
        for (field, value) in resolved {
            let value = plain(value);
            let current = plain(self.get_field(handle, field)?);
            if current != value {
                self.set_field(handle, field, value)?;
                changed += 1;
            }
        }
        event!(Level::DEBUG, object = %id, changed, "merged detached copy");
        self.fire(handle, CallbackEvent::PostAttach)
    }

    /// Make a new persistent object from the copy `id`. Its references are
    /// resolved once it is managed, so cycles back to it find it.
    fn replicate(
        &mut self,
        graph: &DetachedGraph,
        id: &ObjectId,
        visited: &mut HashMap<ObjectId, ObjectHandle>,
    ) -> Result<ObjectHandle> {
        let source = graph
            .object(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        let mut copy = source.clone_boxed();
        copy.state_slot_mut().clear_engine();
        copy.state_slot_mut().set_detached(None);

        let mut deferred = Vec::new();
        for field in 0..copy.field_count() {
            let value = copy.provide_field(field);
            if holds_identity_tokens(&value) && copy.replace_field(field, FieldValue::Null).is_ok() {
                deferred.push((field, value));
            }
        }

        let handle = self.persist_new(copy, None)?;
        visited.insert(id.clone(), handle);
        event!(Level::DEBUG, object = %id, handle = %handle, "replicated detached copy");

        if deferred.is_empty() {
            return Ok(handle);
        }
        let resolved = {
            let mut attacher = AttachFieldManager::new(self, graph, visited);
            for (field, value) in deferred {
                attacher.store_field(field, value)?;
            }
            attacher.into_results()
        };
        for (field, value) in resolved {
            self.set_field(handle, field, value)?;
        }
        Ok(handle)
    }
}
