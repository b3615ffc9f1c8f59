use super::FieldManager;
use crate::context::ExecutionContext;
use crate::core::{FieldValue, ObjectHandle, ObjectId, ObjectRef, PersistenceError, Result};
use crate::engine::DetachedGraph;
use std::collections::HashMap;

/// Turns values of a detached copy back into context values.
///
/// Identity tokens of objects carried in the same detached graph are
/// attached recursively; other tokens are resolved with `find_object`.
/// Inline objects (embedded copies, or new objects added while detached)
/// stay owned and have their own references resolved the same way.
pub struct AttachFieldManager<'a> {
    ctx: &'a mut ExecutionContext,
    graph: &'a DetachedGraph,
    visited: &'a mut HashMap<ObjectId, ObjectHandle>,
    results: Vec<(usize, FieldValue)>,
}

impl<'a> AttachFieldManager<'a> {
    pub fn new(
        ctx: &'a mut ExecutionContext,
        graph: &'a DetachedGraph,
        visited: &'a mut HashMap<ObjectId, ObjectHandle>,
    ) -> Self {
        Self {
            ctx,
            graph,
            visited,
            results: Vec::new(),
        }
    }

    pub fn into_results(self) -> Vec<(usize, FieldValue)> {
        self.results
    }
}

fn holds_identity_tokens(value: &FieldValue) -> bool {
    let mut found = false;
    value.visit_refs(&mut |r| {
        if matches!(r, ObjectRef::Id(_) | ObjectRef::Owned(_)) {
            found = true;
        }
    });
    found
}

fn resolve(
    ctx: &mut ExecutionContext,
    graph: &DetachedGraph,
    visited: &mut HashMap<ObjectId, ObjectHandle>,
    value: FieldValue,
) -> Result<FieldValue> {
    if !holds_identity_tokens(&value) {
        return Ok(value);
    }
    value.try_map_refs(&mut |r| match r {
        ObjectRef::Id(id) => {
            let handle = if graph.contains(&id) {
                ctx.attach_object(graph, &id, visited)?
            } else {
                ctx.find_object(&id, false)?
            };
            Ok(FieldValue::Ref(ObjectRef::Managed(handle)))
        }
        ObjectRef::Owned(mut object) => {
            for field in 0..object.field_count() {
                let inner = object.provide_field(field);
                if holds_identity_tokens(&inner) {
                    let resolved = resolve(ctx, graph, visited, inner)?;
                    object.replace_field(field, resolved)?;
                }
            }
            Ok(FieldValue::Ref(ObjectRef::Owned(object)))
        }
        other => Ok(FieldValue::Ref(other)),
    })
}

impl FieldManager for AttachFieldManager<'_> {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        let resolved = resolve(self.ctx, self.graph, self.visited, value)?;
        self.results.retain(|(f, _)| *f != field);
        self.results.push((field, resolved));
        Ok(())
    }

    fn fetch_field(&mut self, field: usize) -> Result<FieldValue> {
        self.results
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| PersistenceError::User(format!("field {} was not attached", field)))
    }

    fn name(&self) -> &'static str {
        "attach"
    }
}
