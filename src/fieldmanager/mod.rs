// ============================================================================
// Field Managers
// ============================================================================
//
// A FieldManager moves field values between a managed object and somewhere
// else. The engine drives it field by field:
//
// - provide: the object's value is handed to `store_field`
// - replace: the value returned by `fetch_field` is installed in the object
//
// Variants differ in what they do with persistable values on the way:
//
// | Variant             | Effect                                              |
// |---------------------|-----------------------------------------------------|
// | SingleValue         | plain capture, no side effects                      |
// | L2CachePopulate     | live references -> identity tokens, into a snapshot |
// | L2CacheRetrieve     | identity tokens -> live objects, containers wrapped |
// | Persist             | reachability: transient referents made persistent   |
// | Delete              | dependent referents deleted, back-references nulled |
// | Detach / Attach     | recursive copy out of / merge into the context      |
// | UnsetOwner          | tracked containers released from their owner field  |
//
// Managers that need the execution context receive it explicitly when they
// are built, so a manager used inside another one is simply a second value
// on the stack.
//
// ============================================================================

pub mod attach;
pub mod delete;
pub mod detach;
pub mod l2_populate;
pub mod l2_retrieve;
pub mod persist;
pub mod single_value;
pub mod unset_owner;

pub use attach::AttachFieldManager;
pub use delete::DeleteFieldManager;
pub use detach::DetachFieldManager;
pub use l2_populate::L2CachePopulateFieldManager;
pub use l2_retrieve::L2CacheRetrieveFieldManager;
pub use persist::PersistFieldManager;
pub use single_value::SingleValueFieldManager;
pub use unset_owner::UnsetOwnerFieldManager;

use crate::core::{FieldValue, FromFieldValue, PersistenceError, Result};
use paste::paste;

macro_rules! typed_field_methods {
    ($($name:ident: $ty:ty => $variant:ident),* $(,)?) => {
        paste! {
            $(
                fn [<store_ $name _field>](&mut self, field: usize, value: $ty) -> Result<()> {
                    self.store_field(field, FieldValue::$variant(value))
                }

                fn [<fetch_ $name _field>](&mut self, field: usize) -> Result<$ty> {
                    <$ty>::from_field_value(self.fetch_field(field)?)
                }
            )*
        }
    };
}

pub trait FieldManager {
    /// Receive the value of `field` provided by an object
    fn store_field(&mut self, field: usize, _value: FieldValue) -> Result<()> {
        Err(PersistenceError::Unsupported(format!(
            "{} does not accept field {}",
            self.name(),
            field
        )))
    }

    /// Value to install into `field` of an object
    fn fetch_field(&mut self, field: usize) -> Result<FieldValue> {
        Err(PersistenceError::Unsupported(format!(
            "{} does not supply field {}",
            self.name(),
            field
        )))
    }

    fn name(&self) -> &'static str;

    typed_field_methods!(
        boolean: bool => Boolean,
        byte: i8 => Byte,
        char: char => Char,
        short: i16 => Short,
        int: i32 => Int,
        long: i64 => Long,
        float: f32 => Float,
        double: f64 => Double,
        string: String => Text,
    );
}
