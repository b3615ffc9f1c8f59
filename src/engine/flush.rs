// ============================================================================
// Flush
// ============================================================================
//
// Sends pending changes to the persistence handler. A flush repeats passes
// until the dirty list stays empty:
//
// 1. in-place container mutations are turned into dirty fields
// 2. recorded relation changes are applied to the other ends
// 3. each dirty object is inserted, updated or deleted
//
// An insert that references an object with no identity yet is deferred to a
// later pass. When a pass makes no progress at all the new objects form a
// cycle of native identities; the first one is then inserted with the
// unresolved references nulled and updated once its targets exist.
//
// ============================================================================

use crate::cache::CachedSnapshot;
use crate::context::provider::{ProviderOutcome, StoreProvider};
use crate::context::{CallbackEvent, ExecutionContext};
use crate::core::{FieldBitSet, FieldValue, ObjectHandle, PersistenceError, Result};
use crate::fieldmanager::L2CachePopulateFieldManager;
use crate::state::{Activity, LifecycleEvent, LifecycleStage, TransitionOptions};
use crate::store::ObjectProvider;
use crate::types::tracked::{take_tracked_modified, tracked_owner};
use tracing::{Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    Flushed,
    /// References an object that has no identity yet
    Deferred,
    Skipped,
}

impl ExecutionContext {
    /// Send every pending change to the datastore
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_all().map(|_| ())
    }

    /// Flush and return the objects that reached the datastore
    pub(crate) fn flush_all(&mut self) -> Result<Vec<ObjectHandle>> {
        if self.flushing {
            return Ok(Vec::new());
        }
        let span = info_span!("flush", context = %self.id);
        let _enter = span.enter();
        self.flushing = true;
        let result = self.flush_passes();
        self.flushing = false;
        result
    }

    fn flush_passes(&mut self) -> Result<Vec<ObjectHandle>> {
        let mut flushed = Vec::new();
        let mut passes_left = self.arena.len() * 2 + 4;
        loop {
            self.sync_tracked_containers()?;
            if let Some(mut rm) = self.relationships.take() {
                let result = rm.process(self);
                self.relationships = Some(rm);
                result?;
            }

            let pending = std::mem::take(&mut self.dirty);
            self.dirty_set.clear();
            if pending.is_empty() {
                break;
            }

            let mut deferred = Vec::new();
            let mut progress = false;
            for handle in pending {
                match self.flush_object(handle, false)? {
                    FlushOutcome::Flushed => {
                        progress = true;
                        flushed.push(handle);
                    }
                    FlushOutcome::Deferred => deferred.push(handle),
                    FlushOutcome::Skipped => {}
                }
            }
            if !progress && !deferred.is_empty() {
                let first = deferred.remove(0);
                log::warn!(
                    "Circular references between new objects; inserting {} with unresolved references nulled",
                    self.state_manager(first)?.describe()
                );
                if self.flush_object(first, true)? == FlushOutcome::Flushed {
                    flushed.push(first);
                }
            }
            for handle in deferred {
                self.mark_dirty_list(handle);
            }

            if passes_left == 0 {
                return Err(PersistenceError::User(
                    "Flush did not converge: objects keep referencing unflushed objects".into(),
                ));
            }
            passes_left -= 1;
        }
        event!(Level::DEBUG, objects = flushed.len(), "flush complete");
        Ok(flushed)
    }

    /// Tracked containers mutated in place dirty their field
    fn sync_tracked_containers(&mut self) -> Result<()> {
        for link in self.containers.drain() {
            let Ok(slot) = self.arena.get(link.object) else {
                continue;
            };
            if slot.sm.is_deleted()
                || matches!(slot.sm.stage, LifecycleStage::Transient | LifecycleStage::TransientClean)
            {
                continue;
            }
            let Some(fmd) = slot.sm.class.field_meta(link.field) else {
                continue;
            };
            let relation = fmd.is_relation() && !fmd.embedded;
            let value = slot.object.provide_field(link.field);
            if tracked_owner(&value) != Some(link) || !take_tracked_modified(&value) {
                continue;
            }
            if relation {
                let original = self
                    .state_manager(link.object)?
                    .saved
                    .as_ref()
                    .map(|s| s.values[link.field].clone())
                    .unwrap_or(FieldValue::Null);
                if let Some(rm) = self.relationships.as_mut() {
                    rm.record(link.object, link.field, &original, &value);
                }
            }
            self.mark_field_dirty(link.object, link.field)?;
        }
        Ok(())
    }

    fn flush_object(&mut self, handle: ObjectHandle, defer: bool) -> Result<FlushOutcome> {
        let Ok(sm) = self.state_manager(handle) else {
            return Ok(FlushOutcome::Skipped);
        };
        if sm.is_embedded() || !sm.is_dirty() || sm.flags.flushing {
            return Ok(FlushOutcome::Skipped);
        }
        let stage = sm.stage;
        let flushed_new = sm.flags.flushed_new;

        self.sm_mut(handle)?.flags.flushing = true;
        let result = match stage {
            LifecycleStage::PersistentNew if !flushed_new => self.insert(handle, defer),
            LifecycleStage::PersistentDeleted | LifecycleStage::PersistentNewDeleted => {
                self.delete(handle)
            }
            _ => self.update(handle, defer),
        };
        if let Ok(sm) = self.sm_mut(handle) {
            sm.flags.flushing = false;
        }
        result
    }

    fn call_handler(
        &self,
        handle: ObjectHandle,
        next_version: Option<crate::core::Version>,
        defer: bool,
        call: impl FnOnce(&mut dyn ObjectProvider) -> Result<()>,
    ) -> Result<ProviderOutcome> {
        let mut provider = StoreProvider::new(&self.arena, self.types(), handle, self.transaction_id())?
            .with_next_version(next_version)
            .deferring_unresolved(defer);
        call(&mut provider)?;
        Ok(provider.into_outcome())
    }

    fn insert(&mut self, handle: ObjectHandle, defer: bool) -> Result<FlushOutcome> {
        let class = self.class_of(handle)?;
        let saved_dirty = self.state_manager(handle)?.dirty.clone();

        self.sm_mut(handle)?.activity = Activity::InsertingCallbacks;
        if let Err(e) = self.fire(handle, CallbackEvent::PreStore) {
            self.sm_mut(handle)?.activity = Activity::None;
            return Err(e);
        }
        self.sm_mut(handle)?.activity = Activity::Inserting;

        let next_version = class.version_strategy.next(None);
        let handler = self.handler.clone();
        let outcome = match self.call_handler(handle, next_version.clone(), defer, |p| {
            handler.insert_object(p)
        }) {
            Ok(outcome) => outcome,
            Err(e) => {
                let sm = self.sm_mut(handle)?;
                sm.activity = Activity::None;
                if e.is_recoverable() && !defer {
                    sm.dirty = saved_dirty;
                    event!(Level::DEBUG, object = %sm.describe(), reason = %e, "insert deferred");
                    return Ok(FlushOutcome::Deferred);
                }
                return Err(e);
            }
        };

        if let Some(id) = outcome.new_id {
            self.set_post_store_identity(handle, id)?;
        }
        let slot = self.arena.get_mut(handle)?;
        if let (Some(field), Some(version)) = (class.version_field(), &next_version) {
            slot.object.replace_field(field, version.to_field_value())?;
        }
        let sm = &mut slot.sm;
        sm.flags.flushed_new = true;
        sm.version = next_version;
        sm.activity = Activity::None;
        let mut dirty = outcome.nulled;
        dirty.intersect_with(&sm.loaded);
        sm.dirty = dirty;
        event!(Level::DEBUG, object = %sm.describe(), "inserted");
        if !sm.dirty.is_empty() {
            self.mark_dirty_list(handle);
        }

        self.fire(handle, CallbackEvent::PostStore)?;
        self.cache_object(handle)?;
        Ok(FlushOutcome::Flushed)
    }

    fn update(&mut self, handle: ObjectHandle, defer: bool) -> Result<FlushOutcome> {
        if self.state_manager(handle)?.dirty.is_empty() {
            return Ok(FlushOutcome::Skipped);
        }
        // Fields written by a pre-store listener go out with this update
        self.fire(handle, CallbackEvent::PreStore)?;
        let class = self.class_of(handle)?;
        let sm = self.state_manager(handle)?;
        if sm.dirty.is_empty() {
            return Ok(FlushOutcome::Skipped);
        }
        let dirty = sm.dirty.clone();
        let mut fields = dirty.fields();
        if let Some(vf) = class.version_field() {
            if !fields.contains(&vf) {
                fields.push(vf);
            }
        }
        let next_version = class.version_strategy.next(sm.version.as_ref());

        let handler = self.handler.clone();
        let outcome = match self.call_handler(handle, next_version.clone(), defer, |p| {
            handler.update_object(p, &fields)
        }) {
            Ok(outcome) => outcome,
            Err(e) if e.is_recoverable() && !defer => {
                event!(Level::DEBUG, handle = %handle, reason = %e, "update deferred");
                return Ok(FlushOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        let slot = self.arena.get_mut(handle)?;
        if class.is_versioned() {
            if let (Some(field), Some(version)) = (class.version_field(), &next_version) {
                slot.object.replace_field(field, version.to_field_value())?;
            }
            slot.sm.version = next_version;
        }
        let mut still_dirty = outcome.nulled;
        still_dirty.intersect_with(&dirty);
        slot.sm.dirty = still_dirty.clone();
        event!(Level::DEBUG, object = %slot.sm.describe(), fields = fields.len(), "updated");
        if !still_dirty.is_empty() {
            self.mark_dirty_list(handle);
        }

        let written = dirty.difference(&still_dirty);
        self.cache_fields(handle, &written)?;
        self.fire(handle, CallbackEvent::PostStore)?;
        Ok(FlushOutcome::Flushed)
    }

    fn delete(&mut self, handle: ObjectHandle) -> Result<FlushOutcome> {
        let handler = self.handler.clone();
        self.call_handler(handle, None, false, |p| handler.delete_object(p))?;

        let sm = self.sm_mut(handle)?;
        sm.flags.flushed_deleted = true;
        sm.dirty.clear_all();
        let id = sm.id.clone();
        event!(Level::DEBUG, object = %sm.describe(), "deleted");
        if let (Some(l2), Some(id)) = (self.l2.as_ref(), id) {
            l2.evict(&id)?;
        }
        self.fire(handle, CallbackEvent::PostDelete)?;
        Ok(FlushOutcome::Flushed)
    }

    /// Put the loaded, clean fields of `handle` in the second-level cache
    pub(crate) fn cache_object(&mut self, handle: ObjectHandle) -> Result<()> {
        let sm = self.state_manager(handle)?;
        let fields = sm.loaded.clone();
        self.cache_fields(handle, &fields)
    }

    /// Merge `fields` of `handle` into its second-level cache entry.
    /// Dirty fields are never cached.
    pub(crate) fn cache_fields(&mut self, handle: ObjectHandle, fields: &FieldBitSet) -> Result<()> {
        let Some(l2) = self.l2.clone() else {
            return Ok(());
        };
        let sm = self.state_manager(handle)?;
        if !sm.class.cacheable || sm.is_embedded() || sm.is_deleted() {
            return Ok(());
        }
        let Some(id) = sm.id.clone() else {
            return Ok(());
        };
        let mut selected = fields.clone();
        selected.intersect_with(&sm.loaded);
        let selected = selected.difference(&sm.dirty).fields();
        if selected.is_empty() {
            return Ok(());
        }

        let mut populate = L2CachePopulateFieldManager::new(
            &self.arena,
            sm.class.name,
            sm.class.field_count(),
            sm.describe(),
            self.config.cache_embedded,
        );
        self.provide_fields(handle, &selected, &mut populate)?;
        let snapshot: CachedSnapshot = populate.into_snapshot(sm.version.clone());

        l2.merge(id.clone(), snapshot)?;
        if let Some(txn) = self.txn.as_mut().filter(|t| t.is_active()) {
            txn.record_cache_write(id);
        }
        Ok(())
    }

    /// Outside a transaction every change is sent at once and the objects
    /// involved settle as after a commit that retains values.
    pub(crate) fn process_nontransactional_update(&mut self) -> Result<()> {
        if self.flushing || self.is_transaction_active() {
            return Ok(());
        }
        self.flush_all()?;

        let settle = TransitionOptions {
            retain_values: true,
        };
        for handle in self.arena.handles() {
            let Ok(sm) = self.state_manager(handle) else {
                continue;
            };
            let (stage, pending, embedded) = (sm.stage, sm.is_dirty(), sm.is_embedded());
            match stage {
                LifecycleStage::PersistentDeleted | LifecycleStage::PersistentNewDeleted => {
                    if !embedded {
                        self.remove_object(handle)?;
                    }
                }
                LifecycleStage::PersistentNew | LifecycleStage::PersistentDirty if !pending => {
                    self.transition_with(handle, LifecycleEvent::Commit, settle)?;
                    let sm = self.sm_mut(handle)?;
                    sm.dirty.clear_all();
                    sm.saved = None;
                    sm.pre_delete_loaded = None;
                    sm.flags.flushed_new = false;
                    sm.flags.flushed_deleted = false;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Persistable;
    use crate::config::PersistenceConfig;
    use crate::context::PersistenceUnit;
    use crate::core::{ObjectId, ObjectRef};
    use crate::metadata::EnhancementRegistry;
    use crate::state::StateSlot;
    use crate::store::MemoryPersistenceHandler;
    use std::sync::Arc;

    #[derive(Debug, Default, Clone, Persistable)]
    #[persistable(class = "FlushNode", identity = "native")]
    struct Node {
        #[persistable(primary_key)]
        id: i64,
        label: String,
        next: Option<ObjectRef>,
        #[persistable(state)]
        state: StateSlot,
    }

    fn node(label: &str, next: Option<ObjectRef>) -> Node {
        Node {
            label: label.to_string(),
            next,
            ..Default::default()
        }
    }

    fn open() -> (Arc<MemoryPersistenceHandler>, ExecutionContext) {
        let handler = Arc::new(MemoryPersistenceHandler::new());
        let unit = PersistenceUnit::new(
            PersistenceConfig::new().optimistic(true),
            handler.clone(),
            EnhancementRegistry::init(),
        )
        .unwrap();
        unit.register::<Node>().unwrap();
        let ctx = unit.open_context().unwrap();
        (handler, ctx)
    }

    /// a -> b -> a, both waiting for datastore identities
    fn cycle(ctx: &mut ExecutionContext) -> (ObjectHandle, ObjectHandle) {
        ctx.begin().unwrap();
        let a = ctx
            .make_persistent(node("a", Some(ObjectRef::new(node("b", None)))))
            .unwrap();
        let b = ctx.get_field(a, "next").unwrap().as_handle().unwrap();
        ctx.set_field(b, "next", a).unwrap();
        (a, b)
    }

    #[test]
    fn test_insert_referencing_unflushed_object_is_deferred() {
        let (handler, mut ctx) = open();
        let (a, _) = cycle(&mut ctx);
        ctx.set_field(a, "label", "renamed").unwrap();
        let dirty_before = ctx.state_manager(a).unwrap().dirty_fields().clone();

        let outcome = ctx.flush_object(a, false).unwrap();

        assert_eq!(outcome, FlushOutcome::Deferred);
        let sm = ctx.state_manager(a).unwrap();
        assert_eq!(sm.dirty_fields(), &dirty_before);
        assert!(sm.is_dirty());
        assert!(!sm.is_flushed_new());
        assert_eq!(sm.stage(), LifecycleStage::PersistentNew);
        assert_eq!(sm.activity(), Activity::None);
        assert!(sm.invariants_hold());
        assert_eq!(handler.stats().inserts, 0);
    }

    #[test]
    fn test_native_cycle_is_inserted_then_updated() {
        let (handler, mut ctx) = open();
        let (a, b) = cycle(&mut ctx);

        ctx.flush().unwrap();

        let stats = handler.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.updates, 1);
        let a_id = ctx.object_id(a).unwrap().unwrap();
        let b_id = ctx.object_id(b).unwrap().unwrap();
        assert_eq!(
            handler.stored_value(&a_id, Node::FIELD_NEXT),
            Some(FieldValue::Ref(ObjectRef::Id(b_id.clone())))
        );
        assert_eq!(
            handler.stored_value(&b_id, Node::FIELD_NEXT),
            Some(FieldValue::Ref(ObjectRef::Id(a_id.clone())))
        );
        assert_eq!(a_id, ObjectId::long("FlushNode", 1));
        assert!(!ctx.is_dirty(a).unwrap());
        assert!(!ctx.is_dirty(b).unwrap());
        ctx.commit().unwrap();
    }

    #[test]
    fn test_flush_without_changes_sends_nothing() {
        let (handler, mut ctx) = open();
        ctx.begin().unwrap();
        ctx.make_persistent(node("alone", None)).unwrap();
        ctx.flush().unwrap();
        ctx.flush().unwrap();
        assert_eq!(handler.stats().inserts, 1);
        assert_eq!(handler.stats().updates, 0);
    }
}
