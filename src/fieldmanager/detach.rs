use super::FieldManager;
use crate::context::ExecutionContext;
use crate::core::{FieldBitSet, FieldValue, ObjectRef, PersistenceError, Result};
use crate::engine::DetachState;
use crate::metadata::ClassMetadata;
use std::sync::Arc;

/// Copies the values of an object being detached.
///
/// Referenced objects are detached recursively while the fetch depth allows
/// and appear in the copy as identity tokens. A reference met beyond the
/// depth limit is a traversal boundary: the field is reported in
/// `boundary_fields` and, when `unload_boundary` is set, left out of the
/// copy. Embedded objects are copied inline. Containers come out plain.
pub struct DetachFieldManager<'a> {
    ctx: &'a mut ExecutionContext,
    state: &'a mut DetachState,
    class: Arc<ClassMetadata>,
    depth: i32,
    unload_boundary: bool,
    results: Vec<(usize, FieldValue)>,
    boundary: FieldBitSet,
}

impl<'a> DetachFieldManager<'a> {
    pub fn new(
        ctx: &'a mut ExecutionContext,
        state: &'a mut DetachState,
        class: Arc<ClassMetadata>,
        depth: i32,
    ) -> Self {
        let unload_boundary = ctx.config().detach_unload_fields;
        let boundary = FieldBitSet::new(class.field_count());
        Self {
            ctx,
            state,
            class,
            depth,
            unload_boundary,
            results: Vec::new(),
            boundary,
        }
    }

    pub fn boundary_fields(&self) -> &FieldBitSet {
        &self.boundary
    }

    /// Copied values and the fields cut at the traversal boundary
    pub fn finish(self) -> (Vec<(usize, FieldValue)>, FieldBitSet) {
        (self.results, self.boundary)
    }

    fn identity_tokens(&self, value: FieldValue) -> Result<FieldValue> {
        let ctx = &*self.ctx;
        value.try_map_refs(&mut |r| match r {
            ObjectRef::Managed(handle) => {
                let sm = ctx.state_manager(handle)?;
                sm.object_id()
                    .cloned()
                    .map(|id| FieldValue::Ref(ObjectRef::Id(id)))
                    .ok_or_else(|| {
                        PersistenceError::User(format!("{} has no identity to detach", sm.describe()))
                    })
            }
            other => Ok(FieldValue::Ref(other)),
        })
    }
}

fn plain(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::TrackedList(list) => FieldValue::List(list.values()),
        FieldValue::TrackedMap(map) => FieldValue::Map(map.entries()),
        other => other,
    }
}

impl FieldManager for DetachFieldManager<'_> {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        let fmd = self
            .class
            .field_meta(field)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: self.class.name.to_string(),
                field: field.to_string(),
            })?;

        let copied = if fmd.embedded {
            match value {
                FieldValue::Ref(ObjectRef::Managed(child)) => {
                    let copy = self.ctx.detach_embedded(child, self.depth, self.state)?;
                    FieldValue::Ref(ObjectRef::Owned(copy))
                }
                other => plain(other),
            }
        } else if value.referenced_handles().is_empty() {
            plain(value)
        } else if !self.ctx.fetch_plan().within_depth(self.depth + 1) {
            self.boundary.set(field);
            if self.unload_boundary {
                return Ok(());
            }
            self.identity_tokens(value)?
        } else {
            let (ctx, state, depth) = (&mut *self.ctx, &mut *self.state, self.depth);
            value.try_map_refs(&mut |r| match r {
                ObjectRef::Managed(handle) => {
                    let id = ctx.detach_object(handle, depth + 1, state)?;
                    Ok(FieldValue::Ref(ObjectRef::Id(id)))
                }
                other => Ok(FieldValue::Ref(other)),
            })?
        };
        self.results.push((field, copied));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "detach"
    }
}
