use super::FieldManager;
use crate::cache::CachedSnapshot;
use crate::context::ObjectArena;
use crate::context::provider::{Externalizer, Unresolved};
use crate::core::{FieldValue, Result, Version};

/// Builds a second-level cache snapshot from provided field values.
///
/// References become identity tokens. A value that cannot be cached without
/// live state (a reference to an object with no identity, or an embedded
/// object when embedded caching is off) is left out of the snapshot.
pub struct L2CachePopulateFieldManager<'a> {
    externalizer: Externalizer<'a>,
    label: String,
    snapshot: CachedSnapshot,
}

impl<'a> L2CachePopulateFieldManager<'a> {
    pub fn new(
        arena: &'a ObjectArena,
        class: &'static str,
        field_count: usize,
        label: String,
        cache_embedded: bool,
    ) -> Self {
        Self {
            externalizer: Externalizer {
                arena,
                unresolved: Unresolved::Skip,
                inline_embedded: cache_embedded,
            },
            label,
            snapshot: CachedSnapshot::new(class, field_count),
        }
    }

    pub fn into_snapshot(self, version: Option<Version>) -> CachedSnapshot {
        let mut snapshot = self.snapshot;
        snapshot.set_version(version);
        snapshot
    }
}

impl FieldManager for L2CachePopulateFieldManager<'_> {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        match self.externalizer.value(&self.label, value)? {
            (Some(value), _) => self.snapshot.set_field(field, value),
            (None, _) => {
                self.snapshot.exclude_field(field);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "l2-populate"
    }
}
