use super::FieldManager;
use crate::cache::CachedSnapshot;
use crate::context::ExecutionContext;
use crate::core::{FieldBitSet, FieldValue, ObjectHandle, PersistenceError, Result};
use crate::engine::ValueSource;

/// Supplies field values from a second-level cache snapshot, resolving
/// identity tokens to objects of the execution context and rewrapping
/// containers. A field whose referents cannot be found (a stale entry that
/// still points at a deleted row) is recorded as not loadable instead of
/// failing the load.
pub struct L2CacheRetrieveFieldManager<'a> {
    ctx: &'a mut ExecutionContext,
    owner: ObjectHandle,
    snapshot: &'a CachedSnapshot,
    not_loadable: FieldBitSet,
}

impl<'a> L2CacheRetrieveFieldManager<'a> {
    pub fn new(
        ctx: &'a mut ExecutionContext,
        owner: ObjectHandle,
        snapshot: &'a CachedSnapshot,
    ) -> Self {
        let count = snapshot.loaded_fields().len();
        Self {
            ctx,
            owner,
            snapshot,
            not_loadable: FieldBitSet::new(count),
        }
    }

    pub fn not_loadable(&self) -> &FieldBitSet {
        &self.not_loadable
    }
}

impl FieldManager for L2CacheRetrieveFieldManager<'_> {
    fn fetch_field(&mut self, field: usize) -> Result<FieldValue> {
        let value = self.snapshot.value(field).cloned().ok_or_else(|| {
            PersistenceError::User(format!(
                "field {} of {} is not in the cached snapshot",
                field,
                self.snapshot.class_name()
            ))
        })?;
        match self
            .ctx
            .internalize_value(self.owner, field, value, ValueSource::Cache)
        {
            Err(e) if e.is_not_found() => {
                log::warn!(
                    "stale level 2 cache reference in field {} of {}: {}",
                    field,
                    self.snapshot.class_name(),
                    e
                );
                self.not_loadable.set(field);
                Err(e)
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "l2-retrieve"
    }
}
