// ============================================================================
// In-Memory Persistence Handler
// ============================================================================
//
// Reference backend: one table per class, rows keyed by identity key and
// holding store-form field values plus the stored version. Writes made under
// a transaction are logged so the transaction can be rolled back; writes
// made outside one apply immediately. Per-operation counters let callers
// observe datastore traffic.
//
// ============================================================================

use super::{Change, KeyQuery, ObjectProvider, PersistenceHandler, StoredObject};
use crate::context::TransactionId;
use crate::core::{FieldBitSet, FieldValue, KeyValue, ObjectId, PersistenceError, Result, Version};
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Vec<FieldValue>,
    pub version: Option<Version>,
}

#[derive(Debug, Default)]
struct ClassTable {
    rows: BTreeMap<KeyValue, StoredRow>,
    next_native: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<&'static str, ClassTable>,
    sequences: HashMap<String, i64>,
    changes: HashMap<TransactionId, Vec<Change>>,
}

impl MemoryState {
    fn record(&mut self, txn: Option<TransactionId>, change: Change) {
        if let Some(log) = txn.and_then(|t| self.changes.get_mut(&t)) {
            log.push(change);
        }
    }

    fn row(&self, id: &ObjectId) -> Option<&StoredRow> {
        self.tables.get(id.class_name())?.rows.get(id.key())
    }
}

/// Operation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub fetches: u64,
    pub locates: u64,
    pub finds: u64,
    pub queries: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    fetches: AtomicU64,
    locates: AtomicU64,
    finds: AtomicU64,
    queries: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MemoryPersistenceHandler {
    state: RwLock<MemoryState>,
    stats: StatCounters,
    last_fetch: Mutex<Vec<usize>>,
}

fn describe_version(version: Option<&Version>) -> String {
    version.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

fn require_id(object: &dyn ObjectProvider) -> Result<ObjectId> {
    object.object_id().cloned().ok_or_else(|| {
        PersistenceError::User(format!("{} has no identity yet", object.describe()))
    })
}

fn check_version(object: &dyn ObjectProvider, row: &StoredRow) -> Result<()> {
    if !object.class_metadata().is_versioned() {
        return Ok(());
    }
    if object.version() != row.version.as_ref() {
        return Err(PersistenceError::OptimisticConflict {
            object: object.describe(),
            expected: describe_version(object.version()),
            found: describe_version(row.version.as_ref()),
        });
    }
    Ok(())
}

impl MemoryPersistenceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            updates: self.stats.updates.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            locates: self.stats.locates.load(Ordering::Relaxed),
            finds: self.stats.finds.load(Ordering::Relaxed),
            queries: self.stats.queries.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.stats.inserts,
            &self.stats.updates,
            &self.stats.deletes,
            &self.stats.fetches,
            &self.stats.locates,
            &self.stats.finds,
            &self.stats.queries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Fields requested by the most recent fetch
    pub fn last_fetched_fields(&self) -> Vec<usize> {
        self.last_fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn row_count(&self, class: &str) -> usize {
        self.state
            .read()
            .map(|s| s.tables.get(class).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.state
            .read()
            .map(|s| s.row(id).is_some())
            .unwrap_or(false)
    }

    pub fn stored_value(&self, id: &ObjectId, field: usize) -> Option<FieldValue> {
        let state = self.state.read().ok()?;
        state.row(id)?.values.get(field).cloned()
    }

    pub fn stored_version(&self, id: &ObjectId) -> Option<Version> {
        let state = self.state.read().ok()?;
        state.row(id)?.version.clone()
    }

    /// Overwrite one stored value, bypassing the change log
    pub fn poke_value(&self, id: &ObjectId, field: usize, value: FieldValue) -> Result<()> {
        let mut state = self.state.write()?;
        let row = state
            .tables
            .get_mut(id.class_name())
            .and_then(|t| t.rows.get_mut(id.key()))
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        if let Some(slot) = row.values.get_mut(field) {
            *slot = value;
        }
        Ok(())
    }

    /// Remove a row, bypassing the change log
    pub fn remove_row(&self, id: &ObjectId) -> Result<bool> {
        let mut state = self.state.write()?;
        Ok(state
            .tables
            .get_mut(id.class_name())
            .and_then(|t| t.rows.remove(id.key()))
            .is_some())
    }
}

impl PersistenceHandler for MemoryPersistenceHandler {
    fn name(&self) -> &str {
        "memory"
    }

    fn insert_object(&self, object: &mut dyn ObjectProvider) -> Result<()> {
        let class = object.class_metadata().clone();
        let mut values = Vec::with_capacity(class.field_count());
        for field in 0..class.field_count() {
            values.push(object.provide_field(field)?);
        }

        let mut state = self.state.write()?;
        let id = match object.object_id() {
            Some(id) => id.clone(),
            None if class.identity.assigned_by_datastore() => {
                let table = state.tables.entry(class.name).or_default();
                table.next_native += 1;
                let id = ObjectId::long(class.name, table.next_native);
                if let [pk] = class.primary_key_fields() {
                    values[*pk] = FieldValue::Long(table.next_native);
                }
                object.set_post_store_identity(id.clone());
                id
            }
            None => return Err(PersistenceError::User(format!(
                "{} has no identity yet",
                object.describe()
            ))),
        };

        let table = state.tables.entry(id.class_name()).or_default();
        if table.rows.contains_key(id.key()) {
            return Err(anyhow!("duplicate key {} in table {}", id.key(), id.class_name()).into());
        }
        if let KeyValue::Long(n) = id.key() {
            table.next_native = table.next_native.max(*n);
        }
        table.rows.insert(
            id.key().clone(),
            StoredRow {
                values,
                version: object.transaction_version().cloned(),
            },
        );
        state.record(
            object.transaction(),
            Change::InsertRow {
                class: id.class_name(),
                key: id.key().clone(),
            },
        );
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, object = %id, "memory insert");
        Ok(())
    }

    fn update_object(&self, object: &mut dyn ObjectProvider, fields: &[usize]) -> Result<()> {
        let id = require_id(object)?;
        let mut updates = Vec::with_capacity(fields.len());
        for &field in fields {
            updates.push((field, object.provide_field(field)?));
        }

        let mut state = self.state.write()?;
        let row = state
            .tables
            .get_mut(id.class_name())
            .and_then(|t| t.rows.get_mut(id.key()))
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        check_version(object, row)?;
        let old_row = row.clone();
        for (field, value) in updates {
            if let Some(slot) = row.values.get_mut(field) {
                *slot = value;
            }
        }
        if object.class_metadata().is_versioned() {
            row.version = object.transaction_version().cloned();
        }
        state.record(
            object.transaction(),
            Change::UpdateRow {
                class: id.class_name(),
                key: id.key().clone(),
                old_row,
            },
        );
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, object = %id, fields = ?fields, "memory update");
        Ok(())
    }

    fn delete_object(&self, object: &mut dyn ObjectProvider) -> Result<()> {
        let id = require_id(object)?;
        let mut state = self.state.write()?;
        let row = state
            .row(&id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        check_version(object, row)?;
        let old_row = state
            .tables
            .get_mut(id.class_name())
            .and_then(|t| t.rows.remove(id.key()))
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        state.record(
            object.transaction(),
            Change::DeleteRow {
                class: id.class_name(),
                key: id.key().clone(),
                old_row,
            },
        );
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, object = %id, "memory delete");
        Ok(())
    }

    fn fetch_object(&self, object: &mut dyn ObjectProvider, fields: &[usize]) -> Result<()> {
        let id = require_id(object)?;
        let row = {
            let state = self.state.read()?;
            state
                .row(&id)
                .cloned()
                .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?
        };
        for &field in fields {
            let value = row.values.get(field).cloned().unwrap_or(FieldValue::Null);
            object.replace_field(field, value)?;
        }
        object.set_version(row.version);
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        *self.last_fetch.lock()? = fields.to_vec();
        Ok(())
    }

    fn locate_object(&self, object: &mut dyn ObjectProvider) -> Result<()> {
        self.stats.locates.fetch_add(1, Ordering::Relaxed);
        let id = require_id(object)?;
        if self.state.read()?.row(&id).is_some() {
            Ok(())
        } else {
            Err(PersistenceError::ObjectNotFound(id.to_string()))
        }
    }

    fn find_object(&self, id: &ObjectId) -> Result<Option<StoredObject>> {
        self.stats.finds.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read()?;
        let row = state
            .row(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))?;
        Ok(Some(StoredObject {
            id: id.clone(),
            loaded: FieldBitSet::full(row.values.len()),
            values: row.values.clone(),
            version: row.version.clone(),
        }))
    }

    fn execute_key_query(&self, query: &KeyQuery) -> Result<Vec<ObjectId>> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read()?;
        let Some(table) = state.tables.get(query.class) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .filter(|(_, row)| {
                query
                    .parameters
                    .iter()
                    .all(|(field, _, value)| row.values.get(*field) == Some(value))
            })
            .map(|(key, _)| ObjectId::new(query.class, key.clone()))
            .collect())
    }

    fn next_sequence_value(&self, class: &str, field: &str) -> Result<i64> {
        let mut state = self.state.write()?;
        let next = state
            .sequences
            .entry(format!("{}.{}", class, field))
            .or_insert(0);
        *next += 1;
        Ok(*next)
    }

    fn begin_transaction(&self, txn: TransactionId) -> Result<()> {
        self.state.write()?.changes.insert(txn, Vec::new());
        Ok(())
    }

    fn commit_transaction(&self, txn: TransactionId) -> Result<()> {
        self.state.write()?.changes.remove(&txn);
        Ok(())
    }

    fn rollback_transaction(&self, txn: TransactionId) -> Result<()> {
        let mut state = self.state.write()?;
        let Some(log) = state.changes.remove(&txn) else {
            return Ok(());
        };
        let undone = log.len();
        for change in log.into_iter().rev() {
            let table = state.tables.entry(change.class_name()).or_default();
            match change {
                Change::InsertRow { key, .. } => {
                    table.rows.remove(&key);
                }
                Change::UpdateRow { key, old_row, .. } | Change::DeleteRow { key, old_row, .. } => {
                    table.rows.insert(key, old_row);
                }
            }
        }
        event!(Level::DEBUG, txn = %txn, undone, "memory rollback");
        Ok(())
    }
}
