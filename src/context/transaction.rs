// ============================================================================
// Transaction State
// ============================================================================
//
// A unit of work inside one execution context moves through
// Active -> Committed/Aborted. While active it records which objects were
// enlisted (their lifecycle is settled at commit or rollback) and which
// second-level cache entries it wrote, so that a rollback can evict them.
//
// ============================================================================

use crate::core::{ObjectHandle, ObjectId, PersistenceError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    optimistic: bool,
    /// Objects whose lifecycle is settled at commit/rollback, in enlistment order
    enlisted: Vec<ObjectHandle>,
    enlisted_set: HashSet<ObjectHandle>,
    /// Second-level cache entries written by this transaction
    cache_writes: HashSet<ObjectId>,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId, optimistic: bool) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            optimistic,
            enlisted: Vec::new(),
            enlisted_set: HashSet::new(),
            cache_writes: HashSet::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Returns true when `handle` was not enlisted before
    pub fn enlist(&mut self, handle: ObjectHandle) -> bool {
        if self.enlisted_set.insert(handle) {
            self.enlisted.push(handle);
            true
        } else {
            false
        }
    }

    pub fn evict(&mut self, handle: ObjectHandle) {
        if self.enlisted_set.remove(&handle) {
            self.enlisted.retain(|h| *h != handle);
        }
    }

    pub fn is_enlisted(&self, handle: ObjectHandle) -> bool {
        self.enlisted_set.contains(&handle)
    }

    pub fn enlisted(&self) -> &[ObjectHandle] {
        &self.enlisted
    }

    pub(crate) fn take_enlisted(&mut self) -> Vec<ObjectHandle> {
        self.enlisted_set.clear();
        std::mem::take(&mut self.enlisted)
    }

    pub fn record_cache_write(&mut self, id: ObjectId) {
        self.cache_writes.insert(id);
    }

    pub(crate) fn take_cache_writes(&mut self) -> Vec<ObjectId> {
        self.cache_writes.drain().collect()
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(PersistenceError::Transaction(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(PersistenceError::Transaction(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.enlisted.clear();
        self.enlisted_set.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> ObjectHandle {
        ObjectHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_transaction_id_generation() {
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut txn = Transaction::new(TransactionId::new(), false);
        assert!(txn.state().is_active());
        assert!(!txn.state().is_terminal());

        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.state().is_terminal());
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_enlist_is_idempotent_and_ordered() {
        let mut txn = Transaction::new(TransactionId::new(), true);
        assert!(txn.enlist(handle(2)));
        assert!(txn.enlist(handle(1)));
        assert!(!txn.enlist(handle(2)));
        assert_eq!(txn.enlisted(), &[handle(2), handle(1)]);

        txn.evict(handle(2));
        assert!(!txn.is_enlisted(handle(2)));
        assert_eq!(txn.take_enlisted(), vec![handle(1)]);
    }

    #[test]
    fn test_rollback_clears_enlistment() {
        let mut txn = Transaction::new(TransactionId::new(), false);
        txn.enlist(handle(0));
        txn.rollback().unwrap();
        assert!(txn.enlisted().is_empty());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(txn.rollback().is_err());
    }
}
