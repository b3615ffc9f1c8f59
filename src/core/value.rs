use crate::core::{ObjectHandle, ObjectId, PersistenceError, Result};
use crate::state::Persistable;
use crate::types::{TrackedList, TrackedMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Declared type of a persistent field, as seen by the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Text,
    Timestamp,
    Uuid,
    Reference,
    List,
    Map,
    TrackedList,
    TrackedMap,
    /// Untyped slot that may hold any value
    Any,
}

impl FieldType {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            FieldType::List | FieldType::Map | FieldType::TrackedList | FieldType::TrackedMap
        )
    }
}

/// Concurrency-control token of a versioned object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
    Number(i64),
    Timestamp(DateTime<Utc>),
}

impl Version {
    /// Value written to a mapped version field
    pub fn to_field_value(&self) -> FieldValue {
        match self {
            Version::Number(n) => FieldValue::Long(*n),
            Version::Timestamp(ts) => FieldValue::Timestamp(*ts),
        }
    }

    pub fn from_field_value(value: &FieldValue) -> Option<Version> {
        match value {
            FieldValue::Long(n) => Some(Version::Number(*n)),
            FieldValue::Int(n) => Some(Version::Number(*n as i64)),
            FieldValue::Timestamp(ts) => Some(Version::Timestamp(*ts)),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{}", n),
            Version::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// Reference from one persistable field to another object.
#[derive(Debug)]
pub enum ObjectRef {
    /// Object managed by the owning execution context
    Managed(ObjectHandle),
    /// Instance owned by the field itself: a transient object waiting for
    /// reachability, an embedded copy, or an inline detached copy
    Owned(Box<dyn Persistable>),
    /// Identity token, used wherever live objects must not leak
    /// (second-level cache, datastore rows, detached graphs)
    Id(ObjectId),
}

impl ObjectRef {
    pub fn new<T: Persistable>(object: T) -> Self {
        ObjectRef::Owned(Box::new(object))
    }

    pub fn handle(&self) -> Option<ObjectHandle> {
        match self {
            ObjectRef::Managed(h) => Some(*h),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&ObjectId> {
        match self {
            ObjectRef::Id(id) => Some(id),
            _ => None,
        }
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        match self {
            ObjectRef::Managed(h) => ObjectRef::Managed(*h),
            ObjectRef::Owned(obj) => ObjectRef::Owned(obj.clone_boxed()),
            ObjectRef::Id(id) => ObjectRef::Id(id.clone()),
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ObjectRef::Managed(a), ObjectRef::Managed(b)) => a == b,
            (ObjectRef::Id(a), ObjectRef::Id(b)) => a == b,
            (ObjectRef::Owned(a), ObjectRef::Owned(b)) => {
                a.state_slot().instance_id() == b.state_slot().instance_id()
            }
            _ => false,
        }
    }
}

/// Store-independent image of an embedded object: its class and the values
/// of every field, positionally.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedValue {
    pub class: &'static str,
    pub fields: Vec<FieldValue>,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Ref(ObjectRef),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
    TrackedList(TrackedList),
    TrackedMap(TrackedMap),
    Embedded(EmbeddedValue),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "NULL",
            FieldValue::Boolean(_) => "BOOLEAN",
            FieldValue::Byte(_) => "BYTE",
            FieldValue::Char(_) => "CHAR",
            FieldValue::Short(_) => "SHORT",
            FieldValue::Int(_) => "INT",
            FieldValue::Long(_) => "LONG",
            FieldValue::Float(_) => "FLOAT",
            FieldValue::Double(_) => "DOUBLE",
            FieldValue::Text(_) => "TEXT",
            FieldValue::Timestamp(_) => "TIMESTAMP",
            FieldValue::Uuid(_) => "UUID",
            FieldValue::Ref(_) => "REFERENCE",
            FieldValue::List(_) => "LIST",
            FieldValue::Map(_) => "MAP",
            FieldValue::TrackedList(_) => "TRACKED LIST",
            FieldValue::TrackedMap(_) => "TRACKED MAP",
            FieldValue::Embedded(_) => "EMBEDDED",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_ref(&self) -> Option<&ObjectRef> {
        match self {
            FieldValue::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<ObjectHandle> {
        self.as_ref().and_then(ObjectRef::handle)
    }

    /// Managed handles referenced directly or through a container
    pub fn referenced_handles(&self) -> Vec<ObjectHandle> {
        let mut out = Vec::new();
        self.visit_refs(&mut |r| {
            if let ObjectRef::Managed(h) = r {
                out.push(*h);
            }
        });
        out
    }

    pub fn contains_owned_refs(&self) -> bool {
        let mut found = false;
        self.visit_refs(&mut |r| {
            if matches!(r, ObjectRef::Owned(_)) {
                found = true;
            }
        });
        found
    }

    pub fn visit_refs<F: FnMut(&ObjectRef)>(&self, f: &mut F) {
        match self {
            FieldValue::Ref(r) => f(r),
            FieldValue::List(items) => {
                for v in items {
                    v.visit_refs(f);
                }
            }
            FieldValue::Map(entries) => {
                for v in entries.values() {
                    v.visit_refs(f);
                }
            }
            FieldValue::TrackedList(list) => {
                for v in list.values() {
                    v.visit_refs(f);
                }
            }
            FieldValue::TrackedMap(map) => {
                for v in map.entries().values() {
                    v.visit_refs(f);
                }
            }
            FieldValue::Embedded(emb) => {
                for v in &emb.fields {
                    v.visit_refs(f);
                }
            }
            _ => {}
        }
    }

    /// Rewrites every reference, directly held or inside a container.
    ///
    /// Tracked containers come back as plain `List`/`Map` values; callers
    /// that keep the value managed rewrap it afterwards.
    pub fn try_map_refs<F>(self, f: &mut F) -> Result<FieldValue>
    where
        F: FnMut(ObjectRef) -> Result<FieldValue>,
    {
        Ok(match self {
            FieldValue::Ref(r) => f(r)?,
            FieldValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(v.try_map_refs(f)?);
                }
                FieldValue::List(out)
            }
            FieldValue::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    out.insert(k, v.try_map_refs(f)?);
                }
                FieldValue::Map(out)
            }
            FieldValue::TrackedList(list) => FieldValue::List(list.values()).try_map_refs(f)?,
            FieldValue::TrackedMap(map) => FieldValue::Map(map.entries()).try_map_refs(f)?,
            FieldValue::Embedded(emb) => {
                let mut fields = Vec::with_capacity(emb.fields.len());
                for v in emb.fields {
                    fields.push(v.try_map_refs(f)?);
                }
                FieldValue::Embedded(EmbeddedValue {
                    class: emb.class,
                    fields,
                })
            }
            other => other,
        })
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Byte(a), Byte(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (FieldValue::Uuid(a), FieldValue::Uuid(b)) => a == b,
            (Ref(a), Ref(b)) => a == b,
            (Embedded(a), Embedded(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (TrackedList(a), TrackedList(b)) => a.same_contents(b),
            (TrackedMap(a), TrackedMap(b)) => a.same_contents(b),
            (TrackedList(a), List(b)) | (List(b), TrackedList(a)) => &a.values() == b,
            (TrackedMap(a), Map(b)) | (Map(b), TrackedMap(a)) => &a.entries() == b,
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Byte(v) => write!(f, "{}", v),
            FieldValue::Char(v) => write!(f, "{}", v),
            FieldValue::Short(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Double(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "'{}'", v),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            FieldValue::Uuid(v) => write!(f, "{}", v),
            FieldValue::Ref(ObjectRef::Managed(h)) => write!(f, "{}", h),
            FieldValue::Ref(ObjectRef::Id(id)) => write!(f, "{}", id),
            FieldValue::Ref(ObjectRef::Owned(obj)) => write!(f, "<{}>", obj.class_name()),
            FieldValue::List(items) => write!(f, "[{} items]", items.len()),
            FieldValue::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
            FieldValue::TrackedList(list) => write!(f, "[{} items]", list.len()),
            FieldValue::TrackedMap(map) => write!(f, "{{{} entries}}", map.len()),
            FieldValue::Embedded(emb) => write!(f, "<embedded {}>", emb.class),
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::$variant(v)
                }
            }
        )*
    };
}

field_value_from!(
    bool => Boolean,
    i8 => Byte,
    char => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Text,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
    ObjectRef => Ref,
    Vec<FieldValue> => List,
    BTreeMap<String, FieldValue> => Map,
    TrackedList => TrackedList,
    TrackedMap => TrackedMap,
    EmbeddedValue => Embedded,
);

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<ObjectHandle> for FieldValue {
    fn from(handle: ObjectHandle) -> Self {
        FieldValue::Ref(ObjectRef::Managed(handle))
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

// ============================================================================
// Conversions between Rust field types and FieldValue
// ============================================================================

/// Produces the engine-visible value of a struct field.
pub trait IntoFieldValue {
    fn to_field_value(&self) -> FieldValue;
}

/// Installs an engine value into a struct field.
pub trait FromFieldValue: Sized {
    fn from_field_value(value: FieldValue) -> Result<Self>;
}

/// Compile-time type tag of a struct field.
pub trait TypedField {
    const FIELD_TYPE: FieldType;
    const NULLABLE: bool = false;
}

macro_rules! primitive_field {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoFieldValue for $ty {
                fn to_field_value(&self) -> FieldValue {
                    FieldValue::$variant(self.clone())
                }
            }

            impl TypedField for $ty {
                const FIELD_TYPE: FieldType = FieldType::$variant;
            }
        )*
    };
}

primitive_field!(
    bool => Boolean,
    i8 => Byte,
    char => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Text,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
);

macro_rules! strict_from_field {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromFieldValue for $ty {
                fn from_field_value(value: FieldValue) -> Result<Self> {
                    match value {
                        FieldValue::$variant(v) => Ok(v),
                        FieldValue::Null => Ok(<$ty>::default()),
                        other => Err(PersistenceError::type_mismatch(
                            stringify!($variant),
                            other.type_name(),
                        )),
                    }
                }
            }
        )*
    };
}

strict_from_field!(
    bool => Boolean,
    i8 => Byte,
    char => Char,
    i16 => Short,
    f32 => Float,
    String => Text,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
);

impl FromFieldValue for i32 {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Int(v) => Ok(v),
            FieldValue::Short(v) => Ok(v as i32),
            FieldValue::Byte(v) => Ok(v as i32),
            FieldValue::Long(v) => i32::try_from(v)
                .map_err(|_| PersistenceError::type_mismatch("INT", format!("LONG {}", v))),
            FieldValue::Null => Ok(0),
            other => Err(PersistenceError::type_mismatch("INT", other.type_name())),
        }
    }
}

impl FromFieldValue for i64 {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Long(v) => Ok(v),
            FieldValue::Int(v) => Ok(v as i64),
            FieldValue::Short(v) => Ok(v as i64),
            FieldValue::Byte(v) => Ok(v as i64),
            FieldValue::Null => Ok(0),
            other => Err(PersistenceError::type_mismatch("LONG", other.type_name())),
        }
    }
}

impl FromFieldValue for f64 {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Double(v) => Ok(v),
            FieldValue::Float(v) => Ok(v as f64),
            FieldValue::Null => Ok(0.0),
            other => Err(PersistenceError::type_mismatch("DOUBLE", other.type_name())),
        }
    }
}

impl IntoFieldValue for FieldValue {
    fn to_field_value(&self) -> FieldValue {
        self.clone()
    }
}

impl FromFieldValue for FieldValue {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        Ok(value)
    }
}

impl TypedField for FieldValue {
    const FIELD_TYPE: FieldType = FieldType::Any;
    const NULLABLE: bool = true;
}

impl IntoFieldValue for ObjectRef {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Ref(self.clone())
    }
}

impl FromFieldValue for ObjectRef {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Ref(r) => Ok(r),
            other => Err(PersistenceError::type_mismatch("REFERENCE", other.type_name())),
        }
    }
}

impl TypedField for ObjectRef {
    const FIELD_TYPE: FieldType = FieldType::Reference;
}

impl<T: IntoFieldValue> IntoFieldValue for Option<T> {
    fn to_field_value(&self) -> FieldValue {
        match self {
            Some(v) => v.to_field_value(),
            None => FieldValue::Null,
        }
    }
}

impl<T: FromFieldValue> FromFieldValue for Option<T> {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Null => Ok(None),
            other => T::from_field_value(other).map(Some),
        }
    }
}

impl<T: TypedField> TypedField for Option<T> {
    const FIELD_TYPE: FieldType = T::FIELD_TYPE;
    const NULLABLE: bool = true;
}

impl<T: IntoFieldValue> IntoFieldValue for Vec<T> {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::List(self.iter().map(IntoFieldValue::to_field_value).collect())
    }
}

impl<T: FromFieldValue> FromFieldValue for Vec<T> {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        let items = match value {
            FieldValue::List(items) => items,
            FieldValue::TrackedList(list) => list.values(),
            FieldValue::Null => Vec::new(),
            other => return Err(PersistenceError::type_mismatch("LIST", other.type_name())),
        };
        items.into_iter().map(T::from_field_value).collect()
    }
}

impl<T> TypedField for Vec<T> {
    const FIELD_TYPE: FieldType = FieldType::List;
}

impl<T: IntoFieldValue> IntoFieldValue for BTreeMap<String, T> {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_field_value()))
                .collect(),
        )
    }
}

impl<T: FromFieldValue> FromFieldValue for BTreeMap<String, T> {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        let entries = match value {
            FieldValue::Map(entries) => entries,
            FieldValue::TrackedMap(map) => map.entries(),
            FieldValue::Null => BTreeMap::new(),
            other => return Err(PersistenceError::type_mismatch("MAP", other.type_name())),
        };
        entries
            .into_iter()
            .map(|(k, v)| Ok((k, T::from_field_value(v)?)))
            .collect()
    }
}

impl<T> TypedField for BTreeMap<String, T> {
    const FIELD_TYPE: FieldType = FieldType::Map;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_roundtrip_through_null() {
        let none: Option<String> = None;
        assert_eq!(none.to_field_value(), FieldValue::Null);
        let back: Option<String> = FromFieldValue::from_field_value(FieldValue::Null).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(i64::from_field_value(FieldValue::Int(7)).unwrap(), 7);
        assert!(i32::from_field_value(FieldValue::Long(i64::MAX)).is_err());
        assert!(bool::from_field_value(FieldValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_map_refs_rewrites_nested_values() {
        let value = FieldValue::List(vec![
            FieldValue::Ref(ObjectRef::Id(ObjectId::long("Book", 1))),
            FieldValue::Int(3),
        ]);
        let mapped = value
            .try_map_refs(&mut |r| match r {
                ObjectRef::Id(id) => Ok(FieldValue::Text(id.to_string())),
                other => Ok(FieldValue::Ref(other)),
            })
            .unwrap();
        assert_eq!(
            mapped,
            FieldValue::List(vec![FieldValue::Text("Book:1".into()), FieldValue::Int(3)])
        );
    }

    #[test]
    fn test_float_and_ref_equality() {
        assert_eq!(FieldValue::Double(1.5), FieldValue::Double(1.5));
        assert_ne!(FieldValue::Double(1.5), FieldValue::Float(1.5));
        let a = FieldValue::Ref(ObjectRef::Id(ObjectId::long("A", 1)));
        assert_eq!(a.clone(), a);
        assert_eq!(a.referenced_handles().len(), 0);
    }
}
