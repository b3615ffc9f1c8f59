// ============================================================================
// Tracked Containers (second-class mutable values)
// ============================================================================
//
// A tracked container is a shared handle: clones of a TrackedList point at
// the same storage. While a container is installed in a managed field it
// carries an owner link (object + field). A container may have at most one
// owner; installing an owned container into another field is rejected by the
// engine. Mutations set a modified flag, and the first mutation after the
// flag was cleared logs the owner link in the context's container journal.
// At flush time the engine turns the journaled links into dirty marks.
//
// ============================================================================

use crate::core::{
    FieldType, FieldValue, FromFieldValue, IntoFieldValue, ObjectHandle, PersistenceError,
    Result, TypedField,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The field a tracked container is installed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerLink {
    pub object: ObjectHandle,
    pub field: usize,
}

impl fmt::Display for OwnerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.field)
    }
}

/// Owner links of containers mutated since the last drain, shared by every
/// container owned in one execution context.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContainerJournal {
    links: Arc<Mutex<Vec<OwnerLink>>>,
}

impl ContainerJournal {
    fn record(&self, link: OwnerLink) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(link);
    }

    pub(crate) fn drain(&self) -> Vec<OwnerLink> {
        std::mem::take(&mut *self.links.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug)]
struct TrackedInner<C> {
    owner: Option<OwnerLink>,
    journal: Option<ContainerJournal>,
    value: C,
    modified: bool,
}

#[derive(Debug, Clone)]
pub struct Tracked<C> {
    inner: Arc<Mutex<TrackedInner<C>>>,
}

pub type TrackedList = Tracked<Vec<FieldValue>>;
pub type TrackedMap = Tracked<BTreeMap<String, FieldValue>>;

impl<C: Clone + PartialEq> Tracked<C> {
    pub fn from_value(value: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackedInner {
                owner: None,
                journal: None,
                value,
                modified: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackedInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut guard = self.lock();
        let out = f(&mut guard.value);
        if !guard.modified {
            if let (Some(owner), Some(journal)) = (guard.owner, guard.journal.as_ref()) {
                journal.record(owner);
            }
        }
        guard.modified = true;
        out
    }

    pub fn owner(&self) -> Option<OwnerLink> {
        self.lock().owner
    }

    pub(crate) fn set_owner(&self, owner: OwnerLink, journal: &ContainerJournal) {
        let mut guard = self.lock();
        guard.owner = Some(owner);
        guard.journal = Some(journal.clone());
        guard.modified = false;
    }

    pub(crate) fn unset_owner(&self) {
        let mut guard = self.lock();
        guard.owner = None;
        guard.journal = None;
    }

    pub fn is_modified(&self) -> bool {
        self.lock().modified
    }

    pub(crate) fn take_modified(&self) -> bool {
        std::mem::take(&mut self.lock().modified)
    }

    pub fn snapshot(&self) -> C {
        self.lock().value.clone()
    }

    /// Unowned copy with its own storage
    pub fn deep_copy(&self) -> Self {
        Self::from_value(self.snapshot())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn same_contents(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let mine = self.snapshot();
        mine == other.lock().value
    }
}

impl<C: Clone + PartialEq + Default> Default for Tracked<C> {
    fn default() -> Self {
        Self::from_value(C::default())
    }
}

impl TrackedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values<T: IntoFieldValue>(values: impl IntoIterator<Item = T>) -> Self {
        Self::from_value(values.into_iter().map(|v| v.to_field_value()).collect())
    }

    pub fn values(&self) -> Vec<FieldValue> {
        self.snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<FieldValue> {
        self.lock().value.get(index).cloned()
    }

    pub fn contains(&self, value: &FieldValue) -> bool {
        self.lock().value.contains(value)
    }

    pub fn push<T: IntoFieldValue>(&self, value: T) {
        let value = value.to_field_value();
        self.mutate(|items| items.push(value));
    }

    pub fn remove(&self, index: usize) -> Option<FieldValue> {
        self.mutate(|items| (index < items.len()).then(|| items.remove(index)))
    }

    /// Removes the first element equal to `value`
    pub fn remove_value(&self, value: &FieldValue) -> bool {
        self.mutate(|items| match items.iter().position(|v| v == value) {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        })
    }

    pub fn clear(&self) {
        self.mutate(Vec::clear);
    }
}

impl TrackedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> BTreeMap<String, FieldValue> {
        self.snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<FieldValue> {
        self.lock().value.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().value.contains_key(key)
    }

    pub fn insert<T: IntoFieldValue>(&self, key: impl Into<String>, value: T) -> Option<FieldValue> {
        let (key, value) = (key.into(), value.to_field_value());
        self.mutate(|entries| entries.insert(key, value))
    }

    pub fn remove(&self, key: &str) -> Option<FieldValue> {
        self.mutate(|entries| entries.remove(key))
    }

    pub fn clear(&self) {
        self.mutate(BTreeMap::clear);
    }
}

impl IntoFieldValue for TrackedList {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::TrackedList(self.clone())
    }
}

impl FromFieldValue for TrackedList {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::TrackedList(list) => Ok(list),
            FieldValue::List(items) => Ok(TrackedList::from_value(items)),
            FieldValue::Null => Ok(TrackedList::new()),
            other => Err(PersistenceError::type_mismatch(
                "TRACKED LIST",
                other.type_name(),
            )),
        }
    }
}

impl TypedField for TrackedList {
    const FIELD_TYPE: FieldType = FieldType::TrackedList;
}

impl IntoFieldValue for TrackedMap {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::TrackedMap(self.clone())
    }
}

impl FromFieldValue for TrackedMap {
    fn from_field_value(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::TrackedMap(map) => Ok(map),
            FieldValue::Map(entries) => Ok(TrackedMap::from_value(entries)),
            FieldValue::Null => Ok(TrackedMap::new()),
            other => Err(PersistenceError::type_mismatch(
                "TRACKED MAP",
                other.type_name(),
            )),
        }
    }
}

impl TypedField for TrackedMap {
    const FIELD_TYPE: FieldType = FieldType::TrackedMap;
}

/// Owner link of a tracked value, if the value is a tracked container
pub(crate) fn tracked_owner(value: &FieldValue) -> Option<OwnerLink> {
    match value {
        FieldValue::TrackedList(list) => list.owner(),
        FieldValue::TrackedMap(map) => map.owner(),
        _ => None,
    }
}

pub(crate) fn set_tracked_owner(value: &FieldValue, owner: OwnerLink, journal: &ContainerJournal) {
    match value {
        FieldValue::TrackedList(list) => list.set_owner(owner, journal),
        FieldValue::TrackedMap(map) => map.set_owner(owner, journal),
        _ => {}
    }
}

pub(crate) fn unset_tracked_owner(value: &FieldValue) {
    match value {
        FieldValue::TrackedList(list) => list.unset_owner(),
        FieldValue::TrackedMap(map) => map.unset_owner(),
        _ => {}
    }
}

pub(crate) fn take_tracked_modified(value: &FieldValue) -> bool {
    match value {
        FieldValue::TrackedList(list) => list.take_modified(),
        FieldValue::TrackedMap(map) => map.take_modified(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(field: usize) -> OwnerLink {
        OwnerLink {
            object: ObjectHandle {
                index: 0,
                generation: 0,
            },
            field,
        }
    }

    #[test]
    fn test_clones_share_storage() {
        let list = TrackedList::new();
        let alias = list.clone();
        alias.push(5i32);
        assert_eq!(list.len(), 1);
        assert!(list.is_modified());
        assert!(list.take_modified());
        assert!(!list.is_modified());
    }

    #[test]
    fn test_owner_link_follows_all_clones() {
        let list = TrackedList::from_values(vec!["a".to_string()]);
        let alias = list.clone();
        list.set_owner(link(2), &ContainerJournal::default());
        assert_eq!(alias.owner(), Some(link(2)));
        alias.unset_owner();
        assert_eq!(list.owner(), None);
    }

    #[test]
    fn test_first_mutation_is_journaled_once() {
        let journal = ContainerJournal::default();
        let list = TrackedList::new();
        list.push(1i32);
        list.set_owner(link(3), &journal);
        assert!(journal.drain().is_empty());

        list.push(2i32);
        list.push(3i32);
        assert_eq!(journal.drain(), vec![link(3)]);

        assert!(list.take_modified());
        list.remove(0);
        assert_eq!(journal.drain(), vec![link(3)]);

        list.unset_owner();
        list.clear();
        assert!(journal.drain().is_empty());
    }

    #[test]
    fn test_deep_copy_is_detached() {
        let map = TrackedMap::new();
        map.insert("k", 1i64);
        map.set_owner(link(0), &ContainerJournal::default());
        let copy = map.deep_copy();
        assert_eq!(copy.owner(), None);
        assert!(copy.same_contents(&map));
        copy.insert("j", 2i64);
        assert_eq!(map.len(), 1);
    }
}
