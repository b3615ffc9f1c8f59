//! Locating objects by identity and loading their fields.
//!
//! Lookups go through the L1 cache, then the second-level cache, then the
//! persistence handler; an object the handler cannot materialize directly
//! comes back hollow. Field loads consult the second-level cache before the
//! handler's fetch.

use super::ValueSource;
use crate::cache::CachedSnapshot;
use crate::context::ExecutionContext;
use crate::context::provider::StoreProvider;
use crate::core::{FieldBitSet, FieldValue, ObjectHandle, ObjectId, PersistenceError, Result};
use crate::fieldmanager::{FieldManager, L2CacheRetrieveFieldManager};
use crate::state::{LifecycleEvent, LifecycleStage, StateManager};
use crate::store::StoredObject;
use tracing::{Level, event};

impl ExecutionContext {
    /// Managed object for `id`. With `validate` a hollow result is checked
    /// against the datastore first and ObjectNotFound raised when missing.
    pub fn find_object(&mut self, id: &ObjectId, validate: bool) -> Result<ObjectHandle> {
        self.ensure_open()?;
        if let Some(handle) = self.handle_of(id) {
            if validate && self.stage(handle)? == LifecycleStage::Hollow {
                self.validate(handle)?;
            }
            return Ok(handle);
        }

        if let Some(l2) = self.l2.clone() {
            if let Some(snapshot) = l2.get(id)? {
                event!(Level::TRACE, object = %id, "level 2 cache hit");
                let handle = self.new_hollow(id)?;
                self.hydrate_from_cache(handle, &snapshot)?;
                return Ok(handle);
            }
        }

        match self.handler.clone().find_object(id)? {
            Some(stored) => {
                let handle = self.new_hollow(&stored.id)?;
                self.hydrate_from_store(handle, stored)?;
                Ok(handle)
            }
            None => {
                let handle = self.new_hollow(id)?;
                if validate {
                    if let Err(e) = self.validate(handle) {
                        self.remove_object(handle)?;
                        return Err(e);
                    }
                }
                Ok(handle)
            }
        }
    }

    pub fn find_objects(&mut self, ids: &[ObjectId], validate: bool) -> Result<Vec<ObjectHandle>> {
        ids.iter().map(|id| self.find_object(id, validate)).collect()
    }

    /// The single object of `class` whose named fields equal the given
    /// values. No match is ObjectNotFound, several are a user error.
    pub fn find_object_for_keys(
        &mut self,
        class: &str,
        keys: &[(&str, FieldValue)],
    ) -> Result<ObjectHandle> {
        self.ensure_open()?;
        let meta = self.registry.metadata(class)?;
        let mut fields = Vec::with_capacity(keys.len());
        let mut values = Vec::with_capacity(keys.len());
        for (name, value) in keys {
            let field = meta.require_field(name)?;
            let value = match self.types().converter_for_field(&meta.fields[field]) {
                Some(converter) => converter.to_datastore(value.clone())?,
                None => value.clone(),
            };
            fields.push(field);
            values.push(value);
        }
        let id = self.handler.find_object_for_keys(&meta, &fields, values)?;
        self.find_object(&id, false)
    }

    /// Hollow managed instance for `id`, registered in the L1 cache
    fn new_hollow(&mut self, id: &ObjectId) -> Result<ObjectHandle> {
        let class = self.registry.metadata(id.class_name())?;
        let mut object = self.registry.new_instance(class.name)?;
        let components = id.key().components();
        for (&pk, component) in class.primary_key_fields().iter().zip(components) {
            object.replace_field(pk, component.to_field_value())?;
        }
        let handle = self.insert_managed(object, |h, instance| {
            StateManager::for_hollow(class.clone(), h, instance, id.clone())
        });
        if let Err(e) = self.l1_put(id.clone(), handle) {
            self.arena.remove(handle)?;
            return Err(e);
        }
        Ok(handle)
    }

    /// Install the non-relation fields of a cached snapshot; references stay
    /// unloaded and are resolved on first access
    fn hydrate_from_cache(&mut self, handle: ObjectHandle, snapshot: &CachedSnapshot) -> Result<()> {
        let class = self.class_of(handle)?;
        let fields: Vec<usize> = snapshot
            .loaded_fields()
            .difference(class.relation_fields())
            .fields()
            .into_iter()
            .filter(|f| !class.primary_key_fields().contains(f))
            .collect();
        let mut installed = Vec::new();
        for field in fields {
            let value = {
                let mut retrieve = L2CacheRetrieveFieldManager::new(self, handle, snapshot);
                match retrieve.fetch_field(field) {
                    Ok(value) => Some(value),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                }
            };
            if let Some(value) = value {
                installed.push((field, value));
            }
        }
        for (field, value) in installed {
            self.install_field(handle, field, value)?;
        }
        self.sm_mut(handle)?.version = snapshot.version().cloned();
        self.settle_loaded(handle)
    }

    /// Install a full row returned by the handler and share it through the
    /// second-level cache
    fn hydrate_from_store(&mut self, handle: ObjectHandle, stored: StoredObject) -> Result<()> {
        let class = self.class_of(handle)?;
        let mut snapshot = CachedSnapshot::new(class.name, class.field_count());
        for field in stored.loaded.fields() {
            let Some(value) = stored.values.get(field).cloned() else {
                continue;
            };
            let fmd = &class.fields[field];
            let cached = match self.types().converter_for_field(fmd) {
                Some(converter) => converter.from_datastore(value.clone())?,
                None => value.clone(),
            };
            if fmd.embedded && !self.config.cache_embedded {
                snapshot.exclude_field(field);
            } else {
                snapshot.set_field(field, cached)?;
            }
            if fmd.primary_key || class.relation_fields().get(field) {
                continue;
            }
            let value = self.internalize_value(handle, field, value, ValueSource::Store)?;
            self.install_field(handle, field, value)?;
        }
        snapshot.set_version(stored.version.clone());
        self.sm_mut(handle)?.version = stored.version;
        self.settle_loaded(handle)?;

        if class.cacheable {
            if let Some(l2) = self.l2.clone() {
                l2.merge(stored.id, snapshot)?;
            }
        }
        Ok(())
    }

    /// A hollow object whose default fetch group is now in memory becomes
    /// clean and fires post-load
    fn settle_loaded(&mut self, handle: ObjectHandle) -> Result<()> {
        if !self.state_manager(handle)?.unloaded_dfg_fields().is_empty() {
            return Ok(());
        }
        self.transition_object(handle, LifecycleEvent::ReadField { loaded: true })?;
        self.enlist(handle)?;
        self.post_load(handle)
    }

    /// Fetch `fields` of `handle`: second-level cache first, the rest from
    /// the persistence handler. Dirty fields are left alone.
    pub(crate) fn load_fields(&mut self, handle: ObjectHandle, fields: &[usize]) -> Result<()> {
        let sm = self.state_manager(handle)?;
        let mut pending: Vec<usize> = fields.iter().copied().filter(|f| !sm.dirty.get(*f)).collect();
        let Some(id) = sm.id.clone() else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }

        if let Some(l2) = self.l2.clone() {
            if let Some(snapshot) = l2.get(&id)? {
                let cached: Vec<usize> = pending
                    .iter()
                    .copied()
                    .filter(|f| snapshot.loaded_fields().get(*f))
                    .collect();
                let mut from_cache = Vec::new();
                let mut not_loadable = FieldBitSet::new(snapshot.loaded_fields().len());
                {
                    let mut retrieve = L2CacheRetrieveFieldManager::new(self, handle, &snapshot);
                    for &field in &cached {
                        match retrieve.fetch_field(field) {
                            Ok(value) => from_cache.push((field, value)),
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                    not_loadable.union_with(retrieve.not_loadable());
                }
                for (field, value) in from_cache {
                    self.install_field(handle, field, value)?;
                    pending.retain(|f| *f != field);
                }
                if !not_loadable.is_empty() {
                    event!(Level::DEBUG, object = %id, fields = ?not_loadable.fields(), "stale cache fields");
                }
                let sm = self.sm_mut(handle)?;
                if sm.version.is_none() {
                    sm.version = snapshot.version().cloned();
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        event!(Level::TRACE, object = %id, fields = ?pending, "fetching from datastore");
        let handler = self.handler.clone();
        let outcome = {
            let mut provider =
                StoreProvider::new(&self.arena, self.types(), handle, self.transaction_id())?;
            handler.fetch_object(&mut provider, &pending)?;
            provider.into_outcome()
        };
        let fetched = self.apply_fetched(handle, outcome.fetched, outcome.fetched_version)?;
        self.cache_fields(handle, &fetched)
    }

    /// Install values fetched by the handler, returning the fields installed
    fn apply_fetched(
        &mut self,
        handle: ObjectHandle,
        fetched: Vec<(usize, FieldValue)>,
        version: Option<Option<crate::core::Version>>,
    ) -> Result<FieldBitSet> {
        let class = self.class_of(handle)?;
        let mut installed = FieldBitSet::new(class.field_count());
        for (field, value) in fetched {
            if self.state_manager(handle)?.dirty.get(field) {
                continue;
            }
            let value = self.internalize_value(handle, field, value, ValueSource::Store)?;
            self.install_field(handle, field, value)?;
            installed.set(field);
        }
        if let Some(version) = version {
            let sm = self.sm_mut(handle)?;
            let keep = sm.flags.attaching || (sm.is_dirty() && sm.version.is_some());
            if !keep {
                sm.version = version;
            }
        }
        Ok(installed)
    }

    /// Check that `handle` still exists in the datastore
    pub fn validate(&mut self, handle: ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if sm.is_new() || sm.is_embedded() || sm.id.is_none() {
            return Ok(());
        }
        let handler = self.handler.clone();
        let mut provider = StoreProvider::new(&self.arena, self.types(), handle, self.transaction_id())?;
        handler.locate_object(&mut provider)
    }

    /// Reload the loaded fields of `handle` from the datastore, discarding
    /// unflushed changes. The second-level cache is bypassed.
    pub fn refresh(&mut self, handle: ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let sm = self.state_manager(handle)?;
        if sm.is_new() || sm.is_deleted() || sm.is_embedded() || sm.id.is_none() {
            return Ok(());
        }
        let class = sm.class.clone();
        let mut fields = sm.loaded.clone();
        for &pk in class.primary_key_fields() {
            fields.clear(pk);
        }
        let fields = fields.fields();

        {
            let sm = self.sm_mut(handle)?;
            sm.dirty.clear_all();
        }
        if self.dirty_set.remove(&handle) {
            self.dirty.retain(|h| *h != handle);
        }
        if let Some(rm) = self.relationships.as_mut() {
            rm.forget(handle);
        }
        if self.stage(handle)? != LifecycleStage::Hollow {
            self.transition_object(handle, LifecycleEvent::Refresh)?;
        }
        if fields.is_empty() {
            return Ok(());
        }

        let handler = self.handler.clone();
        let fetched = self.changing_state(handle, |ctx| {
            let outcome = {
                let mut provider =
                    StoreProvider::new(&ctx.arena, ctx.types(), handle, ctx.transaction_id())?;
                handler.fetch_object(&mut provider, &fields)?;
                provider.into_outcome()
            };
            ctx.apply_fetched(handle, outcome.fetched, outcome.fetched_version)
        })?;
        event!(Level::DEBUG, object = %self.state_manager(handle)?.describe(), "refreshed");
        self.cache_fields(handle, &fetched)
    }

    /// Resolve `id` without loading: the managed object when present,
    /// otherwise ObjectNotFound
    pub fn lookup(&self, id: &ObjectId) -> Result<ObjectHandle> {
        self.handle_of(id)
            .ok_or_else(|| PersistenceError::ObjectNotFound(id.to_string()))
    }
}
