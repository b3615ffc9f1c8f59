// ============================================================================
// Transaction Boundaries
// ============================================================================
//
// begin/commit/rollback of the context transaction. Objects are enlisted the
// first time they take part; at the end every enlisted object takes the
// commit or rollback transition:
//
// - commit: deleted objects leave the context, the others settle clean or
//   hollow depending on `retain_values`
// - rollback: new objects leave the context, the others get their saved
//   values back (or go hollow when `restore_values` is off) and the
//   second-level cache entries written by the transaction are evicted
//
// ============================================================================

use crate::context::{CallbackEvent, ExecutionContext, Transaction, TransactionId};
use crate::core::{ObjectHandle, PersistenceError, Result};
use crate::state::{LifecycleEvent, LifecycleStage, TransitionOptions};
use tracing::{Level, event, info_span};

impl ExecutionContext {
    pub fn begin(&mut self) -> Result<TransactionId> {
        self.ensure_open()?;
        if let Some(txn) = self.txn.as_ref().filter(|t| t.is_active()) {
            return Err(PersistenceError::Transaction(format!(
                "Transaction {} is already active",
                txn.id()
            )));
        }
        let txn = Transaction::new(TransactionId::new(), self.config.optimistic);
        let id = txn.id();
        self.handler.begin_transaction(id)?;
        self.txn = Some(txn);
        event!(Level::DEBUG, txn = %id, optimistic = self.config.optimistic, "transaction started");

        for handle in self.arena.handles() {
            if self.stage(handle)? == LifecycleStage::TransientClean {
                self.enlist(handle)?;
            }
        }
        Ok(id)
    }

    fn active_transaction_id(&self, action: &str) -> Result<TransactionId> {
        self.txn
            .as_ref()
            .filter(|t| t.is_active())
            .map(Transaction::id)
            .ok_or_else(|| PersistenceError::Transaction(format!("No active transaction to {}", action)))
    }

    /// Flush, commit in the datastore and settle every enlisted object
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let id = self.active_transaction_id("commit")?;
        let span = info_span!("commit", txn = %id);
        let _enter = span.enter();

        self.flush_all()?;
        self.handler.commit_transaction(id)?;
        let enlisted = match self.txn.as_mut() {
            Some(txn) => {
                txn.commit()?;
                txn.take_cache_writes();
                txn.take_enlisted()
            }
            None => Vec::new(),
        };

        let retain = self.config.retain_values;
        for &handle in &enlisted {
            let Ok(sm) = self.state_manager(handle) else {
                continue;
            };
            let embedded = sm.is_embedded();
            let options = TransitionOptions {
                retain_values: retain || embedded,
            };
            match self.transition_with(handle, LifecycleEvent::Commit, options)? {
                LifecycleStage::Transient if !embedded => {
                    self.remove_object(handle)?;
                    continue;
                }
                LifecycleStage::Hollow => {
                    self.fire(handle, CallbackEvent::PreClear)?;
                    self.clear_loaded_fields(handle)?;
                    self.fire(handle, CallbackEvent::PostClear)?;
                }
                _ => {}
            }
            self.reset_transactional_state(handle)?;
        }
        self.end_transaction();
        event!(Level::DEBUG, txn = %id, objects = enlisted.len(), "transaction committed");
        Ok(())
    }

    /// Undo the transaction in the datastore and in memory
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let id = self.active_transaction_id("roll back")?;
        let span = info_span!("rollback", txn = %id);
        let _enter = span.enter();

        let datastore = self.handler.rollback_transaction(id);
        let (enlisted, cache_writes) = match self.txn.as_mut() {
            Some(txn) => {
                let enlisted = txn.take_enlisted();
                let writes = txn.take_cache_writes();
                txn.rollback()?;
                (enlisted, writes)
            }
            None => (Vec::new(), Vec::new()),
        };
        if let Some(l2) = self.l2.clone() {
            for written in &cache_writes {
                l2.evict(written)?;
            }
        }

        // Owners first: restoring an owner rebuilds its embedded objects
        let (owners, embedded): (Vec<ObjectHandle>, Vec<ObjectHandle>) = enlisted
            .iter()
            .copied()
            .filter(|h| self.arena.contains(*h))
            .partition(|h| self.state_manager(*h).is_ok_and(|sm| !sm.is_embedded()));
        for handle in owners {
            if self.arena.contains(handle) {
                self.roll_back_object(handle)?;
            }
        }
        for handle in embedded {
            if self.arena.contains(handle) {
                self.reset_transactional_state(handle)?;
            }
        }
        self.end_transaction();
        event!(
            Level::DEBUG,
            txn = %id,
            objects = enlisted.len(),
            cache_evictions = cache_writes.len(),
            "transaction rolled back"
        );
        datastore
    }

    fn roll_back_object(&mut self, handle: ObjectHandle) -> Result<()> {
        let stage = self.stage(handle)?;
        if stage.is_new() {
            self.remove_object(handle)?;
            return Ok(());
        }
        if stage == LifecycleStage::TransientClean {
            self.restore_fields(handle)?;
            return self.reset_transactional_state(handle);
        }

        let options = TransitionOptions {
            retain_values: self.config.restore_values,
        };
        match self.transition_with(handle, LifecycleEvent::Rollback, options)? {
            LifecycleStage::PersistentClean => {
                self.restore_fields(handle)?;
                if !self.state_manager(handle)?.unloaded_dfg_fields().is_empty() {
                    self.clear_loaded_fields(handle)?;
                    self.transition_object(handle, LifecycleEvent::Evict)?;
                }
            }
            LifecycleStage::Hollow => {
                self.sm_mut(handle)?.saved = None;
                self.clear_loaded_fields(handle)?;
            }
            _ => {}
        }
        self.reset_transactional_state(handle)
    }

    fn reset_transactional_state(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.sm_mut(handle)?;
        sm.saved = None;
        sm.dirty.clear_all();
        sm.pre_delete_loaded = None;
        sm.flags.flushed_new = false;
        sm.flags.flushed_deleted = false;
        self.replace_flags(handle)
    }

    fn end_transaction(&mut self) {
        self.dirty.clear();
        self.dirty_set.clear();
        if let Some(rm) = self.relationships.as_mut() {
            rm.clear();
        }
        self.txn = None;
    }
}
