use super::FieldValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Global execution context ID counter
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Key component of an object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Long(i64),
    Text(String),
    Uuid(Uuid),
    Composite(Vec<KeyValue>),
}

impl KeyValue {
    /// Key component for a primary-key field value, if the value can be one
    pub fn from_field(value: &FieldValue) -> Option<KeyValue> {
        match value {
            FieldValue::Long(v) => Some(KeyValue::Long(*v)),
            FieldValue::Int(v) => Some(KeyValue::Long(*v as i64)),
            FieldValue::Short(v) => Some(KeyValue::Long(*v as i64)),
            FieldValue::Byte(v) => Some(KeyValue::Long(*v as i64)),
            FieldValue::Text(v) => Some(KeyValue::Text(v.clone())),
            FieldValue::Char(v) => Some(KeyValue::Text(v.to_string())),
            FieldValue::Uuid(v) => Some(KeyValue::Uuid(*v)),
            _ => None,
        }
    }

    pub fn to_field_value(&self) -> FieldValue {
        match self {
            KeyValue::Long(v) => FieldValue::Long(*v),
            KeyValue::Text(v) => FieldValue::Text(v.clone()),
            KeyValue::Uuid(v) => FieldValue::Uuid(*v),
            KeyValue::Composite(parts) => {
                FieldValue::List(parts.iter().map(KeyValue::to_field_value).collect())
            }
        }
    }

    /// Components in key order; a simple key is its own single component
    pub fn components(&self) -> Vec<&KeyValue> {
        match self {
            KeyValue::Composite(parts) => parts.iter().collect(),
            other => vec![other],
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Long(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "{}", v),
            KeyValue::Uuid(v) => write!(f, "{}", v),
            KeyValue::Composite(parts) => {
                let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(","))
            }
        }
    }
}

/// Identity of a persistent object: the class it was persisted as plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    class: &'static str,
    key: KeyValue,
}

impl ObjectId {
    pub fn new(class: &'static str, key: KeyValue) -> Self {
        Self { class, key }
    }

    pub fn long(class: &'static str, key: i64) -> Self {
        Self::new(class, KeyValue::Long(key))
    }

    pub fn text(class: &'static str, key: impl Into<String>) -> Self {
        Self::new(class, KeyValue::Text(key.into()))
    }

    pub fn class_name(&self) -> &'static str {
        self.class
    }

    pub fn key(&self) -> &KeyValue {
        &self.key
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.key)
    }
}

/// Stable index of a managed object inside an execution context.
///
/// The generation guards against reuse of a slot after the object it named
/// has left the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjectHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Unique identifier of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        let id = ObjectId::long("Person", 42);
        assert_eq!(id.to_string(), "Person:42");

        let composite = ObjectId::new(
            "OrderLine",
            KeyValue::Composite(vec![KeyValue::Long(1), KeyValue::Text("A".into())]),
        );
        assert_eq!(composite.to_string(), "OrderLine:(1,A)");
    }

    #[test]
    fn test_key_from_field_value() {
        assert_eq!(KeyValue::from_field(&FieldValue::Int(4)), Some(KeyValue::Long(4)));
        assert_eq!(KeyValue::from_field(&FieldValue::Null), None);
        let composite = KeyValue::Composite(vec![KeyValue::Long(1), KeyValue::Text("A".into())]);
        assert_eq!(composite.components().len(), 2);
    }

    #[test]
    fn test_object_id_equality_includes_class() {
        assert_ne!(ObjectId::long("A", 1), ObjectId::long("B", 1));
        assert_eq!(ObjectId::text("A", "x"), ObjectId::text("A", "x"));
    }
}
