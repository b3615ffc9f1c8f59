use crate::core::{FieldValue, PersistenceError, Result};
use uuid::Uuid;

/// Converts a field value between its in-memory form and the form handed to
/// the persistence handler.
pub trait TypeConverter: Send + Sync {
    fn name(&self) -> &str;

    fn to_datastore(&self, value: FieldValue) -> Result<FieldValue>;

    fn from_datastore(&self, value: FieldValue) -> Result<FieldValue>;
}

/// Stores booleans as `'Y'` / `'N'` text.
pub struct BooleanYnConverter;

impl TypeConverter for BooleanYnConverter {
    fn name(&self) -> &str {
        "boolean-yn"
    }

    fn to_datastore(&self, value: FieldValue) -> Result<FieldValue> {
        match value {
            FieldValue::Boolean(true) => Ok(FieldValue::Text("Y".into())),
            FieldValue::Boolean(false) => Ok(FieldValue::Text("N".into())),
            FieldValue::Null => Ok(FieldValue::Null),
            other => Err(PersistenceError::type_mismatch("BOOLEAN", other.type_name())),
        }
    }

    fn from_datastore(&self, value: FieldValue) -> Result<FieldValue> {
        match value {
            FieldValue::Text(s) if s == "Y" => Ok(FieldValue::Boolean(true)),
            FieldValue::Text(s) if s == "N" => Ok(FieldValue::Boolean(false)),
            FieldValue::Null => Ok(FieldValue::Null),
            other => Err(PersistenceError::type_mismatch("'Y' or 'N'", other.to_string())),
        }
    }
}

/// Stores UUIDs in their hyphenated text form.
pub struct UuidStringConverter;

impl TypeConverter for UuidStringConverter {
    fn name(&self) -> &str {
        "uuid-string"
    }

    fn to_datastore(&self, value: FieldValue) -> Result<FieldValue> {
        match value {
            FieldValue::Uuid(u) => Ok(FieldValue::Text(u.hyphenated().to_string())),
            FieldValue::Null => Ok(FieldValue::Null),
            other => Err(PersistenceError::type_mismatch("UUID", other.type_name())),
        }
    }

    fn from_datastore(&self, value: FieldValue) -> Result<FieldValue> {
        match value {
            FieldValue::Text(s) => Uuid::parse_str(&s)
                .map(FieldValue::Uuid)
                .map_err(|e| PersistenceError::type_mismatch("UUID text", e.to_string())),
            FieldValue::Null => Ok(FieldValue::Null),
            other => Err(PersistenceError::type_mismatch("TEXT", other.type_name())),
        }
    }
}
