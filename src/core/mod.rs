pub mod bitset;
pub mod error;
pub mod identity;
pub mod value;

pub use bitset::FieldBitSet;
pub use error::{PersistenceError, Result};
pub use identity::{ContextId, KeyValue, ObjectHandle, ObjectId};
pub use value::{
    EmbeddedValue, FieldType, FieldValue, FromFieldValue, IntoFieldValue, ObjectRef, TypedField,
    Version,
};
