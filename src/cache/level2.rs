// ============================================================================
// Second-Level Cache
// ============================================================================
//
// Cross-session cache of object snapshots keyed by identity. Two tiers:
//
// - pinned:   strongly held, removed only by explicit eviction
// - unpinned: held in an LRU list; `reclaim` drops the least recently used
//             entries when the process is under memory pressure
//
// Entries move between tiers on pin/unpin without changing content.
// Reclamation never touches the pinned tier. Every operation runs under one
// mutex: the cache is consulted once per load miss, not per field access.
// `put` is a no-op once the configured maximum size is reached.
//
// ============================================================================

use super::CachedSnapshot;
use crate::core::{FieldValue, ObjectId, Result, Version};
use crate::metadata::EnhancementRegistry;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, event};

struct Level2Inner {
    pinned: HashMap<ObjectId, CachedSnapshot>,
    unpinned: LruCache<ObjectId, CachedSnapshot>,
    pinned_ids: HashSet<ObjectId>,
    /// (class, include subclasses)
    pinned_classes: Vec<(String, bool)>,
}

impl Level2Inner {
    fn len(&self) -> usize {
        self.pinned.len() + self.unpinned.len()
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.pinned.contains_key(id) || self.unpinned.contains(id)
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct Level2Cache {
    inner: Mutex<Level2Inner>,
    max_size: Option<usize>,
    registry: Arc<EnhancementRegistry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Level2Cache {
    pub fn new(max_size: Option<usize>, registry: Arc<EnhancementRegistry>) -> Self {
        Self {
            inner: Mutex::new(Level2Inner {
                pinned: HashMap::new(),
                unpinned: LruCache::unbounded(),
                pinned_ids: HashSet::new(),
                pinned_classes: Vec::new(),
            }),
            max_size,
            registry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Level2Inner>> {
        Ok(self.inner.lock()?)
    }

    fn class_pinned(&self, inner: &Level2Inner, class: &str) -> bool {
        inner.pinned_classes.iter().any(|(pinned, subclasses)| {
            class == pinned || (*subclasses && self.registry.is_subclass(class, pinned))
        })
    }

    fn matches_class(&self, entry_class: &str, class: &str, include_subclasses: bool) -> bool {
        entry_class == class || (include_subclasses && self.registry.is_subclass(entry_class, class))
    }

    pub fn get(&self, id: &ObjectId) -> Result<Option<CachedSnapshot>> {
        let mut inner = self.lock()?;
        let found = match inner.pinned.get(id) {
            Some(snapshot) => Some(snapshot.clone()),
            None => inner.unpinned.get(id).cloned(),
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.lock()?.contains(id))
    }

    /// Store `snapshot` under `id`. Returns false when the cache is full and
    /// `id` is not already present.
    pub fn put(&self, id: ObjectId, snapshot: CachedSnapshot) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(self.put_locked(&mut inner, id, snapshot))
    }

    fn put_locked(&self, inner: &mut Level2Inner, id: ObjectId, snapshot: CachedSnapshot) -> bool {
        if let Some(existing) = inner.pinned.get_mut(&id) {
            *existing = snapshot;
            return true;
        }
        if inner.unpinned.contains(&id) {
            inner.unpinned.put(id, snapshot);
            return true;
        }
        if let Some(max) = self.max_size {
            if inner.len() >= max {
                log::warn!("level 2 cache full ({} entries), not caching {}", max, id);
                return false;
            }
        }
        let pin = inner.pinned_ids.contains(&id) || self.class_pinned(inner, snapshot.class_name());
        event!(Level::DEBUG, object = %id, pinned = pin, "level 2 cache put");
        if pin {
            inner.pinned.insert(id, snapshot);
        } else {
            inner.unpinned.put(id, snapshot);
        }
        true
    }

    /// Merge `update` into the entry for `id`, creating it if needed. The
    /// read and the write happen under one lock, so a concurrent eviction or
    /// merge is never lost. An update older than the entry is ignored and
    /// false is returned.
    pub fn merge(&self, id: ObjectId, update: CachedSnapshot) -> Result<bool> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let existing = match inner.pinned.get_mut(&id) {
            Some(entry) => Some(entry),
            None => inner.unpinned.get_mut(&id),
        };
        if let Some(entry) = existing {
            if let (Some(newer), Some(older)) = (entry.version(), update.version()) {
                if older < newer {
                    event!(Level::TRACE, object = %id, "level 2 cache kept newer entry");
                    return Ok(false);
                }
            }
            entry.merge_from(update);
            return Ok(true);
        }
        Ok(self.put_locked(inner, id, update))
    }

    /// Merge field values into the entry for `id`, creating it if needed.
    pub fn put_fields(
        &self,
        id: &ObjectId,
        field_count: usize,
        version: Option<Version>,
        fields: Vec<(usize, FieldValue)>,
    ) -> Result<bool> {
        let mut update = CachedSnapshot::new(id.class_name(), field_count);
        update.set_version(version);
        for (field, value) in fields {
            update.set_field(field, value)?;
        }
        self.merge(id.clone(), update)
    }

    pub fn evict(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pinned.remove(id);
        inner.unpinned.pop(id);
        Ok(())
    }

    pub fn evict_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pinned.clear();
        inner.unpinned.clear();
        Ok(())
    }

    /// Evict every entry of `class` (and, optionally, of its subclasses)
    pub fn evict_all_of(&self, class: &str, include_subclasses: bool) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.len();
        inner
            .pinned
            .retain(|_, snap| !self.matches_class(snap.class_name(), class, include_subclasses));
        let doomed: Vec<ObjectId> = inner
            .unpinned
            .iter()
            .filter(|(_, snap)| self.matches_class(snap.class_name(), class, include_subclasses))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            inner.unpinned.pop(id);
        }
        Ok(before - inner.len())
    }

    pub fn pin(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pinned_ids.insert(id.clone());
        if let Some(snapshot) = inner.unpinned.pop(id) {
            inner.pinned.insert(id.clone(), snapshot);
        }
        Ok(())
    }

    pub fn unpin(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pinned_ids.remove(id);
        let class_pinned = inner
            .pinned
            .get(id)
            .is_some_and(|snap| self.class_pinned(&inner, snap.class_name()));
        if !class_pinned {
            if let Some(snapshot) = inner.pinned.remove(id) {
                inner.unpinned.put(id.clone(), snapshot);
            }
        }
        Ok(())
    }

    /// Pin every current and future entry of `class`
    pub fn pin_all(&self, class: &str, include_subclasses: bool) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .pinned_classes
            .push((class.to_string(), include_subclasses));
        let moving: Vec<ObjectId> = inner
            .unpinned
            .iter()
            .filter(|(_, snap)| self.matches_class(snap.class_name(), class, include_subclasses))
            .map(|(id, _)| id.clone())
            .collect();
        for id in moving {
            if let Some(snapshot) = inner.unpinned.pop(&id) {
                inner.pinned.insert(id, snapshot);
            }
        }
        Ok(())
    }

    pub fn unpin_all(&self, class: &str, include_subclasses: bool) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .pinned_classes
            .retain(|(pinned, subclasses)| !(pinned == class && *subclasses == include_subclasses));
        let moving: Vec<ObjectId> = inner
            .pinned
            .iter()
            .filter(|(id, snap)| {
                !inner.pinned_ids.contains(*id)
                    && self.matches_class(snap.class_name(), class, include_subclasses)
                    && !self.class_pinned(&inner, snap.class_name())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in moving {
            if let Some(snapshot) = inner.pinned.remove(&id) {
                inner.unpinned.put(id, snapshot);
            }
        }
        Ok(())
    }

    /// Drop up to `count` least recently used unpinned entries
    pub fn reclaim(&self, count: usize) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut dropped = 0;
        while dropped < count && inner.unpinned.pop_lru().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            event!(Level::DEBUG, dropped, "level 2 cache reclaimed entries");
        }
        Ok(dropped)
    }

    pub fn is_pinned(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.lock()?.pinned.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pinned_len(&self) -> usize {
        self.lock().map(|inner| inner.pinned.len()).unwrap_or(0)
    }

    pub fn unpinned_len(&self) -> usize {
        self.lock().map(|inner| inner.unpinned.len()).unwrap_or(0)
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: Option<usize>) -> Level2Cache {
        Level2Cache::new(max, EnhancementRegistry::init())
    }

    fn snap(class: &'static str, value: i64) -> CachedSnapshot {
        let mut s = CachedSnapshot::new(class, 2);
        s.set_field(0, FieldValue::Long(value)).unwrap();
        s
    }

    #[test]
    fn test_put_then_get() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 1);
        assert!(cache.put(id.clone(), snap("Book", 10)).unwrap());
        let found = cache.get(&id).unwrap().unwrap();
        assert_eq!(found.value(0), Some(&FieldValue::Long(10)));
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.get(&ObjectId::long("Book", 2)).unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_put_is_noop_when_full() {
        let cache = cache(Some(1));
        assert!(cache.put(ObjectId::long("Book", 1), snap("Book", 1)).unwrap());
        assert!(!cache.put(ObjectId::long("Book", 2), snap("Book", 2)).unwrap());
        // replacing an existing entry is still allowed
        assert!(cache.put(ObjectId::long("Book", 1), snap("Book", 5)).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pin_moves_between_tiers() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 1);
        cache.put(id.clone(), snap("Book", 1)).unwrap();
        assert_eq!(cache.unpinned_len(), 1);

        cache.pin(&id).unwrap();
        assert_eq!(cache.pinned_len(), 1);
        assert_eq!(cache.unpinned_len(), 0);

        cache.unpin(&id).unwrap();
        assert_eq!(cache.pinned_len(), 0);
        assert_eq!(cache.get(&id).unwrap().unwrap().value(0), Some(&FieldValue::Long(1)));
    }

    #[test]
    fn test_reclaim_never_touches_pinned() {
        let cache = cache(None);
        for i in 0..5 {
            cache.put(ObjectId::long("Book", i), snap("Book", i)).unwrap();
        }
        cache.pin(&ObjectId::long("Book", 0)).unwrap();
        let dropped = cache.reclaim(100).unwrap();
        assert_eq!(dropped, 4);
        assert!(cache.contains(&ObjectId::long("Book", 0)).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pinned_id_applies_to_future_puts() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 9);
        cache.pin(&id).unwrap();
        cache.put(id.clone(), snap("Book", 9)).unwrap();
        assert!(cache.is_pinned(&id).unwrap());
    }

    #[test]
    fn test_pin_all_and_evict_by_class() {
        let cache = cache(None);
        cache.put(ObjectId::long("Book", 1), snap("Book", 1)).unwrap();
        cache.put(ObjectId::long("Author", 1), snap("Author", 1)).unwrap();

        cache.pin_all("Book", false).unwrap();
        assert_eq!(cache.pinned_len(), 1);
        cache.put(ObjectId::long("Book", 2), snap("Book", 2)).unwrap();
        assert_eq!(cache.pinned_len(), 2);

        cache.unpin_all("Book", false).unwrap();
        assert_eq!(cache.pinned_len(), 0);

        assert_eq!(cache.evict_all_of("Book", true).unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_fields_merges() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 1);
        cache
            .put_fields(&id, 2, None, vec![(0, FieldValue::Long(1))])
            .unwrap();
        cache
            .put_fields(&id, 2, Some(Version::Number(3)), vec![(1, FieldValue::Text("t".into()))])
            .unwrap();
        let snap = cache.get(&id).unwrap().unwrap();
        assert_eq!(snap.loaded_fields().fields(), vec![0, 1]);
        assert_eq!(snap.version(), Some(&Version::Number(3)));
    }

    #[test]
    fn test_merge_keeps_pinned_tier() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 1);
        cache.pin(&id).unwrap();
        cache.merge(id.clone(), snap("Book", 1)).unwrap();

        let mut update = CachedSnapshot::new("Book", 2);
        update.set_field(1, FieldValue::Text("t".into())).unwrap();
        assert!(cache.merge(id.clone(), update).unwrap());
        assert!(cache.is_pinned(&id).unwrap());
        let found = cache.get(&id).unwrap().unwrap();
        assert_eq!(found.loaded_fields().fields(), vec![0, 1]);
    }

    #[test]
    fn test_merge_ignores_older_version() {
        let cache = cache(None);
        let id = ObjectId::long("Book", 1);
        let mut current = snap("Book", 2);
        current.set_version(Some(Version::Number(2)));
        cache.merge(id.clone(), current).unwrap();

        let mut stale = snap("Book", 1);
        stale.set_version(Some(Version::Number(1)));
        assert!(!cache.merge(id.clone(), stale).unwrap());
        let found = cache.get(&id).unwrap().unwrap();
        assert_eq!(found.value(0), Some(&FieldValue::Long(2)));
        assert_eq!(found.version(), Some(&Version::Number(2)));
    }

    #[test]
    fn test_concurrent_merges_lose_nothing() {
        let cache = Arc::new(cache(None));
        let id = ObjectId::long("Book", 1);
        let fields = 8;
        let handles: Vec<_> = (0..fields)
            .map(|field| {
                let cache = cache.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let mut update = CachedSnapshot::new("Book", fields);
                        update.set_field(field, FieldValue::Long(round)).unwrap();
                        cache.merge(id.clone(), update).unwrap();
                        cache.get(&id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let found = cache.get(&id).unwrap().unwrap();
        assert_eq!(found.loaded_fields().fields(), (0..fields).collect::<Vec<_>>());
        for field in 0..fields {
            assert_eq!(found.value(field), Some(&FieldValue::Long(199)));
        }
    }

    #[test]
    fn test_concurrent_get_put_and_evict() {
        let cache = Arc::new(cache(Some(64)));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = ObjectId::long("Book", (i % 32) + worker * 32);
                        cache.put(id.clone(), snap("Book", i)).unwrap();
                        if let Some(found) = cache.get(&id).unwrap() {
                            assert_eq!(found.class_name(), "Book");
                        }
                        if i % 7 == 0 {
                            cache.evict(&id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 64);
        assert_eq!(cache.pinned_len(), 0);
    }
}
