use crate::core::{
    FieldBitSet, FieldType, FieldValue, KeyValue, ObjectId, PersistenceError, Result, Version,
};
use crate::types::TypeRegistry;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// How the identity of a new object is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStrategy {
    /// Built from the primary-key fields
    Application,
    /// Assigned by the persistence handler at insert time
    Native,
    /// Random UUID assigned when the object becomes persistent
    Uuid,
}

impl IdentityStrategy {
    pub fn assigned_by_datastore(&self) -> bool {
        matches!(self, IdentityStrategy::Native)
    }
}

/// Generator for a primary-key field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueStrategy {
    Uuid,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionStrategy {
    #[default]
    None,
    Number,
    DateTime,
}

impl VersionStrategy {
    /// Version following `current`, or the initial version when `current` is absent
    pub fn next(&self, current: Option<&Version>) -> Option<Version> {
        match self {
            VersionStrategy::None => None,
            VersionStrategy::Number => Some(Version::Number(match current {
                Some(Version::Number(n)) => n + 1,
                _ => 1,
            })),
            VersionStrategy::DateTime => Some(Version::Timestamp(Utc::now())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldMetadata {
    pub name: &'static str,
    pub number: usize,
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
    pub version: bool,
    /// `None` until resolved against the type registry
    pub default_fetch_group: Option<bool>,
    pub fetch_groups: Vec<&'static str>,
    pub dependent: bool,
    pub embedded: bool,
    pub target: Option<&'static str>,
    pub mapped_by: Option<&'static str>,
    pub converter: Option<&'static str>,
    pub value_strategy: Option<ValueStrategy>,
}

impl FieldMetadata {
    pub fn new(name: &'static str, number: usize, field_type: FieldType) -> Self {
        Self {
            name,
            number,
            field_type,
            nullable: false,
            primary_key: false,
            version: false,
            default_fetch_group: None,
            fetch_groups: Vec::new(),
            dependent: false,
            embedded: false,
            target: None,
            mapped_by: None,
            converter: None,
            value_strategy: None,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub fn default_fetch_group(mut self, in_dfg: bool) -> Self {
        self.default_fetch_group = Some(in_dfg);
        self
    }

    pub fn fetch_group(mut self, group: &'static str) -> Self {
        self.fetch_groups.push(group);
        self
    }

    pub fn dependent(mut self) -> Self {
        self.dependent = true;
        self
    }

    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self
    }

    pub fn target(mut self, class: &'static str) -> Self {
        self.target = Some(class);
        self
    }

    pub fn mapped_by(mut self, field: &'static str) -> Self {
        self.mapped_by = Some(field);
        self
    }

    pub fn converter(mut self, name: &'static str) -> Self {
        self.converter = Some(name);
        self
    }

    pub fn value_strategy(mut self, strategy: ValueStrategy) -> Self {
        self.value_strategy = Some(strategy);
        self
    }

    /// Holds references to other persistable objects (directly or in a container)
    pub fn is_relation(&self) -> bool {
        self.field_type == FieldType::Reference || self.target.is_some() || self.embedded
    }

    pub fn is_collection(&self) -> bool {
        self.field_type.is_container()
    }

    pub fn in_default_fetch_group(&self) -> bool {
        self.default_fetch_group.unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ClassMetadata {
    pub name: &'static str,
    pub parent: Option<&'static str>,
    pub identity: IdentityStrategy,
    pub version_strategy: VersionStrategy,
    pub detachable: bool,
    pub cacheable: bool,
    pub fields: Vec<FieldMetadata>,
    dfg: FieldBitSet,
    relations: FieldBitSet,
    pk_fields: Vec<usize>,
    version_field: Option<usize>,
}

impl ClassMetadata {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            parent: None,
            identity: IdentityStrategy::Application,
            version_strategy: VersionStrategy::None,
            detachable: false,
            cacheable: true,
            fields: Vec::new(),
            dfg: FieldBitSet::new(0),
            relations: FieldBitSet::new(0),
            pk_fields: Vec::new(),
            version_field: None,
        }
    }

    pub fn identity(mut self, identity: IdentityStrategy) -> Self {
        self.identity = identity;
        self
    }

    pub fn versioned(mut self, strategy: VersionStrategy) -> Self {
        self.version_strategy = strategy;
        self
    }

    pub fn detachable(mut self, detachable: bool) -> Self {
        self.detachable = detachable;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn extends(mut self, parent: &'static str) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    /// Fill in type-driven defaults and the derived field sets.
    pub fn resolve(mut self, types: &TypeRegistry) -> Result<Self> {
        let count = self.fields.len();
        self.dfg = FieldBitSet::new(count);
        self.relations = FieldBitSet::new(count);
        self.pk_fields.clear();
        self.version_field = None;

        for (i, field) in self.fields.iter_mut().enumerate() {
            if field.number != i {
                return Err(PersistenceError::Configuration(format!(
                    "Field '{}' of class '{}' declares number {} at position {}",
                    field.name, self.name, field.number, i
                )));
            }
            if field.default_fetch_group.is_none() {
                let by_type = types.is_default_fetch_group(field.field_type);
                field.default_fetch_group = Some(by_type && !field.embedded);
            }
            if field.in_default_fetch_group() || field.primary_key {
                self.dfg.set(i);
            }
            if field.is_relation() {
                self.relations.set(i);
            }
            if field.primary_key {
                self.pk_fields.push(i);
            }
            if field.version {
                self.version_field = Some(i);
            }
        }

        if self.identity == IdentityStrategy::Application && self.pk_fields.is_empty() {
            return Err(PersistenceError::Configuration(format!(
                "Class '{}' uses application identity but declares no primary key",
                self.name
            )));
        }
        if self.version_field.is_some() && self.version_strategy == VersionStrategy::None {
            self.version_strategy = VersionStrategy::Number;
        }
        Ok(self)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Application identity built from the primary-key values, given in
    /// primary-key order
    pub fn identity_from_keys(&self, keys: &[FieldValue]) -> Result<ObjectId> {
        let mut parts = Vec::with_capacity(keys.len());
        for (value, &field) in keys.iter().zip(self.pk_fields.iter()) {
            let part = KeyValue::from_field(value).ok_or_else(|| {
                PersistenceError::User(format!(
                    "Primary key field '{}' of class '{}' holds {}, which cannot form an identity",
                    self.field_name(field),
                    self.name,
                    value.type_name()
                ))
            })?;
            parts.push(part);
        }
        let key = match parts.len() {
            0 => {
                return Err(PersistenceError::User(format!(
                    "Class '{}' has no primary key values",
                    self.name
                )))
            }
            1 => parts.remove(0),
            _ => KeyValue::Composite(parts),
        };
        Ok(ObjectId::new(self.name, key))
    }

    pub fn field_meta(&self, number: usize) -> Option<&FieldMetadata> {
        self.fields.get(number)
    }

    pub fn field_number(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<usize> {
        self.field_number(name)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: self.name.to_string(),
                field: name.to_string(),
            })
    }

    pub fn field_name(&self, number: usize) -> &'static str {
        self.fields.get(number).map(|f| f.name).unwrap_or("?")
    }

    pub fn primary_key_fields(&self) -> &[usize] {
        &self.pk_fields
    }

    pub fn version_field(&self) -> Option<usize> {
        self.version_field
    }

    pub fn is_versioned(&self) -> bool {
        self.version_strategy != VersionStrategy::None
    }

    pub fn default_fetch_group_fields(&self) -> &FieldBitSet {
        &self.dfg
    }

    pub fn relation_fields(&self) -> &FieldBitSet {
        &self.relations
    }

    pub fn all_fields(&self) -> FieldBitSet {
        FieldBitSet::full(self.fields.len())
    }

    pub fn fetch_group_fields(&self, group: &str) -> FieldBitSet {
        let mut set = FieldBitSet::new(self.fields.len());
        for field in &self.fields {
            if field.fetch_groups.iter().any(|g| *g == group) {
                set.set(field.number);
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> ClassMetadata {
        ClassMetadata::new("Person")
            .field(FieldMetadata::new("id", 0, FieldType::Long).primary_key())
            .field(FieldMetadata::new("name", 1, FieldType::Text))
            .field(FieldMetadata::new("bio", 2, FieldType::Text).default_fetch_group(false))
            .field(FieldMetadata::new("friend", 3, FieldType::Reference).target("Person"))
            .field(FieldMetadata::new("rev", 4, FieldType::Long).version())
    }

    #[test]
    fn test_resolve_computes_field_sets() {
        let meta = person().resolve(&TypeRegistry::new()).unwrap();
        assert_eq!(meta.default_fetch_group_fields().fields(), vec![0, 1, 4]);
        assert_eq!(meta.relation_fields().fields(), vec![3]);
        assert_eq!(meta.primary_key_fields(), &[0]);
        assert_eq!(meta.version_field(), Some(4));
        assert_eq!(meta.version_strategy, VersionStrategy::Number);
    }

    #[test]
    fn test_application_identity_requires_key() {
        let meta = ClassMetadata::new("Loose").field(FieldMetadata::new("x", 0, FieldType::Int));
        let err = meta.resolve(&TypeRegistry::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_identity_from_keys() {
        let meta = person().resolve(&TypeRegistry::new()).unwrap();
        let id = meta.identity_from_keys(&[FieldValue::Long(7)]).unwrap();
        assert_eq!(id, ObjectId::long("Person", 7));
        assert!(meta.identity_from_keys(&[FieldValue::Null]).is_err());
    }

    #[test]
    fn test_version_strategy_next() {
        assert_eq!(VersionStrategy::Number.next(None), Some(Version::Number(1)));
        assert_eq!(
            VersionStrategy::Number.next(Some(&Version::Number(4))),
            Some(Version::Number(5))
        );
        assert_eq!(VersionStrategy::None.next(None), None);
    }
}
