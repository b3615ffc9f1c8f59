use super::FieldManager;
use crate::context::ExecutionContext;
use crate::core::{FieldValue, ObjectHandle, ObjectRef, PersistenceError, Result};
use crate::metadata::FieldMetadata;

/// Persistence by reachability.
///
/// Every transient object found in a stored value is made persistent and
/// replaced by its handle; objects registered only as transactional are
/// promoted. For embedded fields the value becomes an embedded object owned
/// by the field. Fetching a field returns its rewritten value.
pub struct PersistFieldManager<'a> {
    ctx: &'a mut ExecutionContext,
    owner: ObjectHandle,
    results: Vec<(usize, FieldValue)>,
}

impl<'a> PersistFieldManager<'a> {
    pub fn new(ctx: &'a mut ExecutionContext, owner: ObjectHandle) -> Self {
        Self {
            ctx,
            owner,
            results: Vec::new(),
        }
    }

    pub fn into_results(self) -> Vec<(usize, FieldValue)> {
        self.results
    }

    fn field_meta(&self, field: usize) -> Result<FieldMetadata> {
        let class = self.ctx.state_manager(self.owner)?.class_metadata();
        class
            .field_meta(field)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownField {
                class: class.name.to_string(),
                field: field.to_string(),
            })
    }

    fn reach(&mut self, value: FieldValue) -> Result<FieldValue> {
        if !value.contains_owned_refs() {
            for handle in value.referenced_handles() {
                self.ctx.make_persistent_handle(handle)?;
            }
            return Ok(value);
        }
        let ctx = &mut *self.ctx;
        value.try_map_refs(&mut |r| match r {
            ObjectRef::Owned(object) => {
                let handle = ctx.make_persistent_boxed(object)?;
                Ok(FieldValue::Ref(ObjectRef::Managed(handle)))
            }
            ObjectRef::Managed(handle) => {
                ctx.make_persistent_handle(handle)?;
                Ok(FieldValue::Ref(ObjectRef::Managed(handle)))
            }
            other => Ok(FieldValue::Ref(other)),
        })
    }

    fn embed(&mut self, field: usize, value: FieldValue) -> Result<FieldValue> {
        let handle = match value {
            FieldValue::Ref(ObjectRef::Owned(object)) => {
                self.ctx.make_embedded(self.owner, field, object)?
            }
            FieldValue::Ref(ObjectRef::Managed(child)) => {
                let owned_here = self
                    .ctx
                    .state_manager(child)?
                    .embedded_owner()
                    .is_some_and(|o| o.owner == self.owner && o.field == field);
                if owned_here {
                    child
                } else {
                    let mut copy = self.ctx.arena.get(child)?.object.clone_boxed();
                    copy.state_slot_mut().clear_engine();
                    self.ctx.make_embedded(self.owner, field, copy)?
                }
            }
            FieldValue::Embedded(image) => {
                self.ctx.materialize_embedded(self.owner, field, image)?
            }
            other => return Ok(other),
        };
        Ok(FieldValue::Ref(ObjectRef::Managed(handle)))
    }
}

impl FieldManager for PersistFieldManager<'_> {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        let fmd = self.field_meta(field)?;
        let value = if fmd.embedded {
            self.embed(field, value)?
        } else {
            self.reach(value)?
        };
        let value = self.ctx.types().wrap_value(fmd.field_type, value);
        self.results.retain(|(f, _)| *f != field);
        self.results.push((field, value));
        Ok(())
    }

    fn fetch_field(&mut self, field: usize) -> Result<FieldValue> {
        self.results
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| PersistenceError::User(format!("field {} was not reached", field)))
    }

    fn name(&self) -> &'static str {
        "persist"
    }
}
