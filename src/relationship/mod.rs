// ============================================================================
// Relationship Manager
// ============================================================================
//
// Keeps both ends of bidirectional relations consistent. Field writes on a
// relation record (original, current) per (object, field); at flush the
// recorded deltas are applied to the other end:
//
// - a collection inverse gets the owner added or removed
// - a single-valued inverse is pointed at the owner, and whatever it pointed
//   at before loses its reference to the target
//
// With checks enabled, an explicit assignment on the other end that
// contradicts a recorded change is rejected before anything is applied.
//
// ============================================================================

use crate::context::ExecutionContext;
use crate::core::{FieldValue, ObjectHandle, ObjectRef, PersistenceError, Result};
use std::collections::BTreeMap;
use tracing::{Level, event};

/// Value of a relation field before the first recorded write, and now
#[derive(Debug, Clone)]
pub struct RelationChange {
    pub original: FieldValue,
    pub current: FieldValue,
}

impl RelationChange {
    fn added(&self) -> Vec<ObjectHandle> {
        let before = self.original.referenced_handles();
        let mut out = Vec::new();
        for h in self.current.referenced_handles() {
            if !before.contains(&h) && !out.contains(&h) {
                out.push(h);
            }
        }
        out
    }

    fn removed(&self) -> Vec<ObjectHandle> {
        let after = self.current.referenced_handles();
        let mut out = Vec::new();
        for h in self.original.referenced_handles() {
            if !after.contains(&h) && !out.contains(&h) {
                out.push(h);
            }
        }
        out
    }
}

/// Containers are recorded by content, not by shared storage
fn plain(value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::TrackedList(list) => FieldValue::List(list.values()),
        FieldValue::TrackedMap(map) => FieldValue::Map(map.entries()),
        other => other.clone(),
    }
}

#[derive(Debug)]
struct PendingUpdate {
    owner: ObjectHandle,
    field: usize,
    field_is_collection: bool,
    inverse: usize,
    inverse_is_collection: bool,
    added: Vec<ObjectHandle>,
    removed: Vec<ObjectHandle>,
}

#[derive(Debug, Default)]
pub struct RelationshipManager {
    changes: BTreeMap<(ObjectHandle, usize), RelationChange>,
    checks: bool,
}

impl RelationshipManager {
    pub fn new(checks: bool) -> Self {
        Self {
            changes: BTreeMap::new(),
            checks,
        }
    }

    /// Note a write of `field`. The first original seen for a field is kept.
    pub fn record(&mut self, owner: ObjectHandle, field: usize, old: &FieldValue, new: &FieldValue) {
        let entry = self
            .changes
            .entry((owner, field))
            .or_insert_with(|| RelationChange {
                original: plain(old),
                current: FieldValue::Null,
            });
        entry.current = plain(new);
        if entry.original == entry.current {
            self.changes.remove(&(owner, field));
        }
    }

    pub fn change(&self, owner: ObjectHandle, field: usize) -> Option<&RelationChange> {
        self.changes.get(&(owner, field))
    }

    /// Drop everything recorded for `owner`
    pub fn forget(&mut self, owner: ObjectHandle) {
        self.changes.retain(|(h, _), _| *h != owner);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Apply every recorded change to the other end of its relation.
    ///
    /// The manager is taken out of the context while this runs, so the field
    /// writes made here are not recorded again.
    pub(crate) fn process(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(&mut self.changes);
        let mut pending = Vec::new();
        for ((owner, field), change) in &changes {
            let Ok(sm) = ctx.state_manager(*owner) else {
                continue;
            };
            if sm.is_deleted() {
                continue;
            }
            let class = sm.class_metadata().clone();
            let Some((inverse_class, inverse)) = ctx.registry().inverse_field(class.name, *field)
            else {
                continue;
            };
            pending.push(PendingUpdate {
                owner: *owner,
                field: *field,
                field_is_collection: class.field_meta(*field).is_some_and(|m| m.is_collection()),
                inverse,
                inverse_is_collection: inverse_class
                    .field_meta(inverse)
                    .is_some_and(|m| m.is_collection()),
                added: change.added(),
                removed: change.removed(),
            });
        }

        // A failed pass keeps its changes for the next flush
        let result = self.check_and_apply(ctx, &changes, &pending);
        if result.is_err() {
            self.changes = changes;
            return result;
        }
        event!(Level::DEBUG, relations = pending.len(), "relationships processed");
        Ok(())
    }

    fn check_and_apply(
        &self,
        ctx: &mut ExecutionContext,
        changes: &BTreeMap<(ObjectHandle, usize), RelationChange>,
        pending: &[PendingUpdate],
    ) -> Result<()> {
        if self.checks {
            check_consistency(ctx, changes, pending)?;
        }
        for update in pending {
            apply(ctx, update)?;
        }
        Ok(())
    }
}

fn check_consistency(
    ctx: &ExecutionContext,
    changes: &BTreeMap<(ObjectHandle, usize), RelationChange>,
    pending: &[PendingUpdate],
) -> Result<()> {
    for update in pending {
        for target in &update.added {
            let Some(other) = changes.get(&(*target, update.inverse)) else {
                continue;
            };
            let points_back = other.current.referenced_handles().contains(&update.owner);
            // A collection only contradicts when the owner was taken out of it
            let contradicts = if update.inverse_is_collection {
                !points_back && other.original.referenced_handles().contains(&update.owner)
            } else {
                !points_back
            };
            if contradicts {
                let owner = ctx.state_manager(update.owner)?;
                let target_sm = ctx.state_manager(*target)?;
                return Err(PersistenceError::User(format!(
                    "Inconsistent bidirectional relation: {}.{} references {} but {}.{} was set to {}",
                    owner.describe(),
                    owner.field_label(update.field),
                    target_sm.describe(),
                    target_sm.describe(),
                    target_sm.field_label(update.inverse),
                    other.current
                )));
            }
        }
    }
    Ok(())
}

fn live(ctx: &ExecutionContext, handle: ObjectHandle) -> bool {
    ctx.state_manager(handle).is_ok_and(|sm| !sm.is_deleted())
}

fn apply(ctx: &mut ExecutionContext, update: &PendingUpdate) -> Result<()> {
    let owner_ref = FieldValue::Ref(ObjectRef::Managed(update.owner));

    for &target in &update.added {
        if !live(ctx, target) {
            continue;
        }
        if update.inverse_is_collection {
            ctx.add_to_collection(target, update.inverse, owner_ref.clone())?;
            continue;
        }
        let previous = ctx.get_field(target, update.inverse)?.as_handle();
        if previous == Some(update.owner) {
            continue;
        }
        // The target leaves whatever held it before
        if let Some(prev) = previous.filter(|p| live(ctx, *p)) {
            let target_ref = FieldValue::Ref(ObjectRef::Managed(target));
            if update.field_is_collection {
                ctx.remove_from_collection(prev, update.field, &target_ref)?;
            } else if ctx.get_field(prev, update.field)?.as_handle() == Some(target) {
                ctx.set_field(prev, update.field, FieldValue::Null)?;
            }
        }
        ctx.set_field(target, update.inverse, owner_ref.clone())?;
    }

    for &target in &update.removed {
        if !live(ctx, target) {
            continue;
        }
        if update.inverse_is_collection {
            ctx.remove_from_collection(target, update.inverse, &owner_ref)?;
        } else if ctx.get_field(target, update.inverse)?.as_handle() == Some(update.owner) {
            ctx.set_field(target, update.inverse, FieldValue::Null)?;
        }
    }
    Ok(())
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
    fn test_record_keeps_first_original() {
        let mut rm = RelationshipManager::new(true);
        let a = FieldValue::from(handle(1));
        let b = FieldValue::from(handle(2));
        let c = FieldValue::from(handle(3));
        rm.record(handle(0), 2, &a, &b);
        rm.record(handle(0), 2, &b, &c);

        let change = rm.change(handle(0), 2).unwrap();
        assert_eq!(change.original, a);
        assert_eq!(change.current, c);
        assert_eq!(change.added(), vec![handle(3)]);
        assert_eq!(change.removed(), vec![handle(1)]);
    }

    #[test]
    fn test_record_back_to_original_drops_change() {
        let mut rm = RelationshipManager::new(false);
        let a = FieldValue::from(handle(1));
        rm.record(handle(0), 1, &a, &FieldValue::Null);
        assert_eq!(rm.len(), 1);
        rm.record(handle(0), 1, &FieldValue::Null, &a);
        assert!(rm.is_empty());
    }

    #[test]
    fn test_collection_delta() {
        let mut rm = RelationshipManager::new(false);
        let before = FieldValue::List(vec![handle(1).into(), handle(2).into()]);
        let after = FieldValue::List(vec![handle(2).into(), handle(3).into()]);
        rm.record(handle(0), 3, &before, &after);
        let change = rm.change(handle(0), 3).unwrap();
        assert_eq!(change.added(), vec![handle(3)]);
        assert_eq!(change.removed(), vec![handle(1)]);

        rm.forget(handle(0));
        assert!(rm.is_empty());
    }
}
