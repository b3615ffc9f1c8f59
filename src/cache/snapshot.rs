use crate::core::{FieldBitSet, FieldValue, ObjectRef, PersistenceError, Result, Version};

/// Datastore-independent image of a persistent object held by the
/// second-level cache. Values are positional; references are identity
/// tokens and containers are plain values, so a snapshot never points into
/// any execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    class: &'static str,
    loaded: FieldBitSet,
    /// Left out on purpose; a merge drops these from the older entry
    excluded: FieldBitSet,
    values: Vec<FieldValue>,
    version: Option<Version>,
}

impl CachedSnapshot {
    pub fn new(class: &'static str, field_count: usize) -> Self {
        Self {
            class,
            loaded: FieldBitSet::new(field_count),
            excluded: FieldBitSet::new(field_count),
            values: vec![FieldValue::Null; field_count],
            version: None,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class
    }

    pub fn loaded_fields(&self) -> &FieldBitSet {
        &self.loaded
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    /// Value of `field` if the snapshot holds it
    pub fn value(&self, field: usize) -> Option<&FieldValue> {
        if self.loaded.get(field) {
            self.values.get(field)
        } else {
            None
        }
    }

    pub fn set_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        if field >= self.values.len() {
            return Err(PersistenceError::UnknownField {
                class: self.class.to_string(),
                field: field.to_string(),
            });
        }
        if holds_live_state(&value) {
            return Err(PersistenceError::User(format!(
                "Cached value for field {} of {} references live objects",
                field, self.class
            )));
        }
        self.values[field] = value;
        self.loaded.set(field);
        self.excluded.clear(field);
        Ok(())
    }

    pub fn unset_field(&mut self, field: usize) {
        if field < self.values.len() {
            self.values[field] = FieldValue::Null;
            self.loaded.clear(field);
        }
    }

    /// Mark `field` as one that must not be served from the cache
    pub fn exclude_field(&mut self, field: usize) {
        if field < self.values.len() {
            self.unset_field(field);
            self.excluded.set(field);
        }
    }

    /// Copy every field held by `other` into this snapshot and drop the
    /// ones it excluded
    pub fn merge_from(&mut self, other: CachedSnapshot) {
        for field in other.excluded.fields() {
            self.unset_field(field);
        }
        for field in other.loaded.fields() {
            if let Some(slot) = self.values.get_mut(field) {
                *slot = other.values[field].clone();
                self.loaded.set(field);
            }
        }
        if other.version.is_some() {
            self.version = other.version;
        }
    }
}

/// Anything a second-level cache entry must not contain
pub(crate) fn holds_live_state(value: &FieldValue) -> bool {
    let mut live = matches!(value, FieldValue::TrackedList(_) | FieldValue::TrackedMap(_));
    value.visit_refs(&mut |r| {
        if !matches!(r, ObjectRef::Id(_)) {
            live = true;
        }
    });
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ObjectHandle, ObjectId};

    #[test]
    fn test_snapshot_rejects_live_refs() {
        let mut snap = CachedSnapshot::new("Book", 3);
        let live = FieldValue::Ref(ObjectRef::Managed(ObjectHandle {
            index: 0,
            generation: 0,
        }));
        assert!(snap.set_field(1, live).is_err());

        let token = FieldValue::Ref(ObjectRef::Id(ObjectId::long("Author", 1)));
        snap.set_field(1, token.clone()).unwrap();
        assert_eq!(snap.value(1), Some(&token));
        assert_eq!(snap.value(0), None);
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let mut base = CachedSnapshot::new("Book", 3);
        base.set_field(0, FieldValue::Long(1)).unwrap();
        let mut update = CachedSnapshot::new("Book", 3);
        update.set_field(2, FieldValue::Text("x".into())).unwrap();
        update.set_version(Some(Version::Number(2)));

        base.merge_from(update);
        assert_eq!(base.loaded_fields().fields(), vec![0, 2]);
        assert_eq!(base.version(), Some(&Version::Number(2)));
    }

    #[test]
    fn test_merge_drops_excluded_fields() {
        let mut base = CachedSnapshot::new("Person", 3);
        base.set_field(1, FieldValue::Text("ann".into())).unwrap();
        base.set_field(2, FieldValue::Text("Paris".into())).unwrap();

        let mut update = CachedSnapshot::new("Person", 3);
        update.set_field(1, FieldValue::Text("bob".into())).unwrap();
        update.exclude_field(2);
        assert_eq!(update.value(2), None);

        base.merge_from(update);
        assert_eq!(base.value(1), Some(&FieldValue::Text("bob".into())));
        assert_eq!(base.value(2), None);
        assert_eq!(base.loaded_fields().fields(), vec![1]);
    }
}
