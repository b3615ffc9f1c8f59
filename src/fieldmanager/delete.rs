use super::FieldManager;
use crate::context::ExecutionContext;
use crate::core::{FieldValue, ObjectHandle, ObjectRef, PersistenceError, Result};
use crate::metadata::ClassMetadata;
use std::sync::Arc;
use tracing::{Level, event};

/// Cascade applied to the relation fields of an object being deleted.
///
/// - dependent referents are deleted as well
/// - referents of a managed bidirectional relation lose their
///   back-reference (nulled, or removed from the inverse collection)
/// - embedded objects are left to go with their owner
pub struct DeleteFieldManager<'a> {
    ctx: &'a mut ExecutionContext,
    owner: ObjectHandle,
    class: Arc<ClassMetadata>,
    cascaded: usize,
}

impl<'a> DeleteFieldManager<'a> {
    pub fn new(ctx: &'a mut ExecutionContext, owner: ObjectHandle) -> Result<Self> {
        let class = ctx.state_manager(owner)?.class_metadata().clone();
        Ok(Self {
            ctx,
            owner,
            class,
            cascaded: 0,
        })
    }

    /// Objects deleted or updated by the cascade so far
    pub fn cascaded(&self) -> usize {
        self.cascaded
    }

    fn live_target(&self, handle: ObjectHandle) -> bool {
        self.ctx
            .state_manager(handle)
            .is_ok_and(|sm| !sm.is_deleted())
    }
}

impl FieldManager for DeleteFieldManager<'_> {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        let fmd = self
            .class
            .field_meta(field)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: self.class.name.to_string(),
                field: field.to_string(),
            })?;
        if fmd.embedded {
            return Ok(());
        }
        let targets: Vec<ObjectHandle> = value
            .referenced_handles()
            .into_iter()
            .filter(|h| *h != self.owner && self.live_target(*h))
            .collect();

        if fmd.dependent {
            for target in targets {
                event!(Level::DEBUG, field = fmd.name, target = %target, "cascade delete");
                self.ctx.delete_persistent(target)?;
                self.cascaded += 1;
            }
            return Ok(());
        }

        if !self.ctx.config().manage_relationships {
            return Ok(());
        }
        let Some((inverse_class, inverse)) = self.ctx.registry().inverse_field(self.class.name, field)
        else {
            return Ok(());
        };
        let inverse_is_collection = inverse_class
            .field_meta(inverse)
            .is_some_and(|m| m.is_collection());
        let owner_ref = FieldValue::Ref(ObjectRef::Managed(self.owner));
        for target in targets {
            if inverse_is_collection {
                if self.ctx.remove_from_collection(target, inverse, &owner_ref)? {
                    self.cascaded += 1;
                }
            } else if self.ctx.get_field(target, inverse)?.as_handle() == Some(self.owner) {
                self.ctx.set_field(target, inverse, FieldValue::Null)?;
                self.cascaded += 1;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "delete"
    }
}
