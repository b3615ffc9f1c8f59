// ============================================================================
// Persistable Contract
// ============================================================================
//
// Every domain class managed by the engine implements Persistable, normally
// through #[derive(Persistable)]. The trait is the per-class dispatch table
// the engine uses instead of rewritten field accessors: fields are addressed
// by number, read with provide_field and written with replace_field.
//
// ============================================================================

use super::StateSlot;
use crate::core::{FieldValue, Result};
use crate::metadata::ClassMetadata;
use std::any::Any;
use std::fmt;

pub trait Persistable: Any + Send + Sync + fmt::Debug {
    fn class_name(&self) -> &'static str;

    fn field_count(&self) -> usize;

    /// Current in-memory value of `field`
    fn provide_field(&self, field: usize) -> FieldValue;

    /// Install `value` into `field`
    fn replace_field(&mut self, field: usize, value: FieldValue) -> Result<()>;

    fn state_slot(&self) -> &StateSlot;

    fn state_slot_mut(&mut self) -> &mut StateSlot;

    /// Blank instance of the same class
    fn new_instance(&self) -> Box<dyn Persistable>;

    fn clone_boxed(&self) -> Box<dyn Persistable>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Static side of a persistable class.
pub trait PersistableClass: Persistable + Sized {
    const CLASS_NAME: &'static str;

    fn class_metadata() -> ClassMetadata;

    fn new_boxed() -> Box<dyn Persistable>;
}

impl dyn Persistable {
    pub fn downcast_ref<T: Persistable>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Persistable>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn downcast<T: Persistable>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }

    pub fn is<T: Persistable>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl Clone for Box<dyn Persistable> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}
