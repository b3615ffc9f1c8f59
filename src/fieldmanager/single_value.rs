use super::FieldManager;
use crate::core::{FieldValue, PersistenceError, Result};

/// Holds one value: whatever was stored last is what gets fetched.
#[derive(Debug, Default)]
pub struct SingleValueFieldManager {
    value: Option<(usize, FieldValue)>,
}

impl SingleValueFieldManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(field: usize, value: FieldValue) -> Self {
        Self {
            value: Some((field, value)),
        }
    }

    pub fn value(&self) -> Option<&FieldValue> {
        self.value.as_ref().map(|(_, v)| v)
    }

    pub fn take(&mut self) -> Option<FieldValue> {
        self.value.take().map(|(_, v)| v)
    }
}

impl FieldManager for SingleValueFieldManager {
    fn store_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        self.value = Some((field, value));
        Ok(())
    }

    fn fetch_field(&mut self, field: usize) -> Result<FieldValue> {
        match &self.value {
            Some((stored, value)) if *stored == field => Ok(value.clone()),
            _ => Err(PersistenceError::User(format!(
                "no value captured for field {}",
                field
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "single-value"
    }
}
