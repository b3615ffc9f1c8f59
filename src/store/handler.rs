// ============================================================================
// Persistence Handler Boundary
// ============================================================================
//
// The only way the engine reaches a datastore. Every per-object call gets an
// ObjectProvider: a view of one managed object with values already converted
// to their store form (references as identity tokens, embedded objects
// inline, converters applied). Values fetched by the handler are handed back
// through the same provider and applied by the engine afterwards.
//
// ============================================================================

use crate::context::TransactionId;
use crate::core::{FieldBitSet, FieldValue, ObjectId, PersistenceError, Result, Version};
use crate::metadata::ClassMetadata;
use std::sync::Arc;

/// One managed object as seen by a persistence handler
pub trait ObjectProvider {
    fn class_metadata(&self) -> &Arc<ClassMetadata>;

    /// `None` until a datastore-assigned identity is reported back
    fn object_id(&self) -> Option<&ObjectId>;

    /// Version the datastore is expected to hold
    fn version(&self) -> Option<&Version>;

    /// Version to write with this operation
    fn transaction_version(&self) -> Option<&Version>;

    /// Transaction the operation belongs to, if any
    fn transaction(&self) -> Option<TransactionId>;

    /// Store form of `field`
    fn provide_field(&self, field: usize) -> Result<FieldValue>;

    /// Hand a fetched store value of `field` back to the engine
    fn replace_field(&mut self, field: usize, value: FieldValue) -> Result<()>;

    /// Identity assigned by the datastore during insert
    fn set_post_store_identity(&mut self, id: ObjectId);

    /// Version found in the datastore while fetching
    fn set_version(&mut self, version: Option<Version>);

    /// Label used in errors
    fn describe(&self) -> String {
        match self.object_id() {
            Some(id) => id.to_string(),
            None => format!("new {}", self.class_metadata().name),
        }
    }
}

/// Full stored image of one object, as returned by identity lookups
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub id: ObjectId,
    pub values: Vec<FieldValue>,
    pub loaded: FieldBitSet,
    pub version: Option<Version>,
}

/// Key-equality lookup synthesized for `find_object_for_keys`
#[derive(Debug, Clone, PartialEq)]
pub struct KeyQuery {
    pub class: &'static str,
    /// Query text for backends that speak a query language
    pub filter: String,
    /// (field number, parameter name, value) in filter order
    pub parameters: Vec<(usize, String, FieldValue)>,
}

impl KeyQuery {
    /// `SELECT FROM C WHERE this.a == :val0 && this.b == :val1`
    pub fn for_keys(class: &ClassMetadata, fields: &[usize], keys: Vec<FieldValue>) -> Result<Self> {
        if fields.len() != keys.len() || fields.is_empty() {
            return Err(PersistenceError::User(format!(
                "Lookup on class '{}' needs one value per key field ({} fields, {} values)",
                class.name,
                fields.len(),
                keys.len()
            )));
        }
        let mut clauses = Vec::with_capacity(fields.len());
        let mut parameters = Vec::with_capacity(fields.len());
        for (i, (&field, value)) in fields.iter().zip(keys).enumerate() {
            let param = format!("val{}", i);
            clauses.push(format!("this.{} == :{}", class.field_name(field), param));
            parameters.push((field, param, value));
        }
        Ok(Self {
            class: class.name,
            filter: format!("SELECT FROM {} WHERE {}", class.name, clauses.join(" && ")),
            parameters,
        })
    }
}

/// Per-backend datastore operations.
///
/// Bulk variants loop over the single-object calls unless a backend batches
/// them. `find_object` returning `Ok(None)` means "not known here", and the
/// engine falls back to a hollow object.
pub trait PersistenceHandler: Send + Sync {
    fn name(&self) -> &str;

    fn insert_object(&self, object: &mut dyn ObjectProvider) -> Result<()>;

    fn update_object(&self, object: &mut dyn ObjectProvider, fields: &[usize]) -> Result<()>;

    fn delete_object(&self, object: &mut dyn ObjectProvider) -> Result<()>;

    fn fetch_object(&self, object: &mut dyn ObjectProvider, fields: &[usize]) -> Result<()>;

    /// Fails with `ObjectNotFound` when the object is not in the datastore
    fn locate_object(&self, object: &mut dyn ObjectProvider) -> Result<()>;

    fn insert_objects(&self, objects: &mut [&mut dyn ObjectProvider]) -> Result<()> {
        for object in objects.iter_mut() {
            self.insert_object(&mut **object)?;
        }
        Ok(())
    }

    fn delete_objects(&self, objects: &mut [&mut dyn ObjectProvider]) -> Result<()> {
        for object in objects.iter_mut() {
            self.delete_object(&mut **object)?;
        }
        Ok(())
    }

    fn locate_objects(&self, objects: &mut [&mut dyn ObjectProvider]) -> Result<()> {
        for object in objects.iter_mut() {
            self.locate_object(&mut **object)?;
        }
        Ok(())
    }

    /// Full row for `id`. `Ok(None)` means the backend has no direct lookup
    /// and the caller falls back to a hollow object; a missing row is
    /// ObjectNotFound.
    fn find_object(&self, _id: &ObjectId) -> Result<Option<StoredObject>> {
        Ok(None)
    }

    fn find_objects(&self, ids: &[ObjectId]) -> Result<Vec<Option<StoredObject>>> {
        ids.iter().map(|id| self.find_object(id)).collect()
    }

    /// Identities matching `query`
    fn execute_key_query(&self, query: &KeyQuery) -> Result<Vec<ObjectId>> {
        Err(PersistenceError::Unsupported(format!(
            "{} cannot execute '{}'",
            self.name(),
            query.filter
        )))
    }

    /// Identity of the single object of `class` whose `fields` equal `keys`
    fn find_object_for_keys(
        &self,
        class: &ClassMetadata,
        fields: &[usize],
        keys: Vec<FieldValue>,
    ) -> Result<ObjectId> {
        let query = KeyQuery::for_keys(class, fields, keys)?;
        let mut found = self.execute_key_query(&query)?;
        match found.len() {
            0 => Err(PersistenceError::ObjectNotFound(query.filter)),
            1 => Ok(found.remove(0)),
            n => Err(PersistenceError::User(format!(
                "Lookup '{}' matched {} objects, expected one",
                query.filter, n
            ))),
        }
    }

    fn next_sequence_value(&self, class: &str, field: &str) -> Result<i64> {
        Err(PersistenceError::Unsupported(format!(
            "{} has no sequence for {}.{}",
            self.name(),
            class,
            field
        )))
    }

    fn begin_transaction(&self, _txn: TransactionId) -> Result<()> {
        Ok(())
    }

    fn commit_transaction(&self, _txn: TransactionId) -> Result<()> {
        Ok(())
    }

    fn rollback_transaction(&self, _txn: TransactionId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldType;
    use crate::metadata::FieldMetadata;
    use crate::types::TypeRegistry;

    fn account() -> ClassMetadata {
        ClassMetadata::new("Account")
            .field(FieldMetadata::new("id", 0, FieldType::Long).primary_key())
            .field(FieldMetadata::new("owner", 1, FieldType::Text))
            .field(FieldMetadata::new("branch", 2, FieldType::Text))
            .resolve(&TypeRegistry::new())
            .unwrap()
    }

    #[test]
    fn test_key_query_filter_text() {
        let query = KeyQuery::for_keys(
            &account(),
            &[1, 2],
            vec![FieldValue::Text("ann".into()), FieldValue::Text("north".into())],
        )
        .unwrap();
        assert_eq!(
            query.filter,
            "SELECT FROM Account WHERE this.owner == :val0 && this.branch == :val1"
        );
        assert_eq!(query.parameters[1].1, "val1");
    }

    #[test]
    fn test_key_query_arity_mismatch() {
        let err = KeyQuery::for_keys(&account(), &[1, 2], vec![FieldValue::Null]).unwrap_err();
        assert!(err.is_user_error());
    }
}
