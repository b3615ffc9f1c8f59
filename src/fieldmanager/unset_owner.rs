use super::FieldManager;
use crate::core::{FieldValue, ObjectHandle, Result};
use crate::types::OwnerLink;

/// Releases tracked containers from the field they are installed in.
/// Containers installed somewhere else are left alone.
#[derive(Debug)]
pub struct UnsetOwnerFieldManager {
    owner: ObjectHandle,
    released: usize,
}

impl UnsetOwnerFieldManager {
    pub fn new(owner: ObjectHandle) -> Self {
        Self { owner, released: 0 }
    }

    pub fn released(&self) -> usize {
        self.released
    }

    fn owned_here(&self, link: Option<OwnerLink>, field: usize) -> bool {
        link.is_some_and(|l| l.object == self.owner && l.field == field)
    }
}

impl FieldManager for UnsetOwnerFieldManager {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        match &value {
            FieldValue::TrackedList(list) if self.owned_here(list.owner(), field) => {
                list.unset_owner();
                self.released += 1;
            }
            FieldValue::TrackedMap(map) if self.owned_here(map.owner(), field) => {
                map.unset_owner();
                self.released += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "unset-owner"
    }
}
