// ============================================================================
// Datastore Change Log
// ============================================================================
//
// Command Pattern for reversible row operations in the memory backend.
// Each Change records enough to undo itself; a rollback replays the log of
// one transaction backwards.
//
// ============================================================================

use super::memory::StoredRow;
use crate::core::KeyValue;

#[derive(Debug, Clone)]
pub enum Change {
    InsertRow {
        class: &'static str,
        key: KeyValue,
    },

    UpdateRow {
        class: &'static str,
        key: KeyValue,
        old_row: StoredRow,
    },

    DeleteRow {
        class: &'static str,
        key: KeyValue,
        old_row: StoredRow,
    },
}

impl Change {
    /// Class table affected by this change
    pub fn class_name(&self) -> &'static str {
        match self {
            Change::InsertRow { class, .. } => class,
            Change::UpdateRow { class, .. } => class,
            Change::DeleteRow { class, .. } => class,
        }
    }

    pub fn key(&self) -> &KeyValue {
        match self {
            Change::InsertRow { key, .. } => key,
            Change::UpdateRow { key, .. } => key,
            Change::DeleteRow { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_class_name() {
        let change = Change::InsertRow {
            class: "Book",
            key: KeyValue::Long(1),
        };
        assert_eq!(change.class_name(), "Book");
        assert_eq!(change.key(), &KeyValue::Long(1));
    }
}
