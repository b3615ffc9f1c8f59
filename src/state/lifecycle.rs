// ============================================================================
// Lifecycle Stages
// ============================================================================
//
// Implements the lifecycle of a managed object as a single tagged enum plus
// a transition table. Every (stage, event) pair either yields the next stage
// or is undefined; undefined pairs are reported by the engine as
// IllegalTransition errors and never silently ignored.
//
// Main paths:
// ```text
// Transient ──makePersistent──> PersistentNew ──commit──> PersistentClean/Hollow
//                                    │
//                                    └──delete──> PersistentNewDeleted ──commit──> Transient
//
// Hollow ──read──> PersistentClean ──write──> PersistentDirty ──commit──> PersistentClean/Hollow
//   │                    │                          │
//   └──────────delete────┴──────────────────────────┴──> PersistentDeleted ──commit──> Transient
//
// Persistent* ──detach──> DetachedClean ──write──> DetachedDirty ──attach──> Persistent*
// ```
//
// ============================================================================

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    Transient,
    TransientClean,
    Hollow,
    PersistentClean,
    PersistentDirty,
    PersistentNew,
    PersistentDeleted,
    PersistentNewDeleted,
    DetachedClean,
    DetachedDirty,
}

impl LifecycleStage {
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            LifecycleStage::Hollow
                | LifecycleStage::PersistentClean
                | LifecycleStage::PersistentDirty
                | LifecycleStage::PersistentNew
                | LifecycleStage::PersistentDeleted
                | LifecycleStage::PersistentNewDeleted
        )
    }

    pub fn is_transactional(&self) -> bool {
        self.is_persistent() && *self != LifecycleStage::Hollow
            || *self == LifecycleStage::TransientClean
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            LifecycleStage::PersistentDirty
                | LifecycleStage::PersistentNew
                | LifecycleStage::PersistentDeleted
                | LifecycleStage::PersistentNewDeleted
                | LifecycleStage::DetachedDirty
        )
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            LifecycleStage::PersistentNew | LifecycleStage::PersistentNewDeleted
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            LifecycleStage::PersistentDeleted | LifecycleStage::PersistentNewDeleted
        )
    }

    pub fn is_detached(&self) -> bool {
        matches!(
            self,
            LifecycleStage::DetachedClean | LifecycleStage::DetachedDirty
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleStage::Transient => "transient",
            LifecycleStage::TransientClean => "transient-clean",
            LifecycleStage::Hollow => "hollow",
            LifecycleStage::PersistentClean => "persistent-clean",
            LifecycleStage::PersistentDirty => "persistent-dirty",
            LifecycleStage::PersistentNew => "persistent-new",
            LifecycleStage::PersistentDeleted => "persistent-deleted",
            LifecycleStage::PersistentNewDeleted => "persistent-new-deleted",
            LifecycleStage::DetachedClean => "detached-clean",
            LifecycleStage::DetachedDirty => "detached-dirty",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation requested on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    MakePersistent,
    MakeTransactional,
    MakeTransient,
    /// `loaded` tells whether the value is valid in memory
    ReadField { loaded: bool },
    WriteField,
    DeletePersistent,
    Commit,
    Rollback,
    Refresh,
    Evict,
    Detach,
    Attach,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::MakePersistent => "make persistent",
            LifecycleEvent::MakeTransactional => "make transactional",
            LifecycleEvent::MakeTransient => "make transient",
            LifecycleEvent::ReadField { .. } => "read field",
            LifecycleEvent::WriteField => "write field",
            LifecycleEvent::DeletePersistent => "delete",
            LifecycleEvent::Commit => "commit",
            LifecycleEvent::Rollback => "rollback",
            LifecycleEvent::Refresh => "refresh",
            LifecycleEvent::Evict => "evict",
            LifecycleEvent::Detach => "detach",
            LifecycleEvent::Attach => "attach",
        };
        f.write_str(name)
    }
}

/// Settings that influence the end-of-transaction stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionOptions {
    pub retain_values: bool,
}

/// Next stage for `event` applied in `stage`, or `None` when undefined.
pub fn transition(
    stage: LifecycleStage,
    event: LifecycleEvent,
    options: TransitionOptions,
) -> Option<LifecycleStage> {
    use LifecycleEvent as E;
    use LifecycleStage as S;

    let settled = if options.retain_values {
        S::PersistentClean
    } else {
        S::Hollow
    };

    let next = match (stage, event) {
        (S::Transient, E::MakePersistent) => S::PersistentNew,
        (S::Transient, E::MakeTransactional) => S::TransientClean,
        (
            S::Transient,
            E::ReadField { .. } | E::WriteField | E::Commit | E::Rollback | E::MakeTransient,
        ) => S::Transient,

        (S::TransientClean, E::MakePersistent) => S::PersistentNew,
        (S::TransientClean, E::MakeTransient) => S::Transient,
        (
            S::TransientClean,
            E::MakeTransactional
            | E::ReadField { .. }
            | E::WriteField
            | E::Commit
            | E::Rollback
            | E::Evict
            | E::Refresh,
        ) => S::TransientClean,

        (S::Hollow, E::ReadField { .. }) => S::PersistentClean,
        (S::Hollow, E::WriteField) => S::PersistentDirty,
        (S::Hollow, E::DeletePersistent) => S::PersistentDeleted,
        (S::Hollow, E::Detach) => S::DetachedClean,
        (S::Hollow, E::MakeTransient) => S::Transient,
        (
            S::Hollow,
            E::Commit
            | E::Rollback
            | E::Refresh
            | E::Evict
            | E::MakePersistent
            | E::MakeTransactional
            | E::Attach,
        ) => S::Hollow,

        (S::PersistentClean, E::WriteField) => S::PersistentDirty,
        (S::PersistentClean, E::DeletePersistent) => S::PersistentDeleted,
        (S::PersistentClean, E::Commit | E::Rollback) => settled,
        (S::PersistentClean, E::Evict) => S::Hollow,
        (S::PersistentClean, E::Detach) => S::DetachedClean,
        (S::PersistentClean, E::MakeTransient) => S::Transient,
        (
            S::PersistentClean,
            E::ReadField { .. }
            | E::Refresh
            | E::MakePersistent
            | E::MakeTransactional
            | E::Attach,
        ) => S::PersistentClean,

        (S::PersistentDirty, E::DeletePersistent) => S::PersistentDeleted,
        (S::PersistentDirty, E::Commit | E::Rollback) => settled,
        (S::PersistentDirty, E::Refresh) => S::PersistentClean,
        (S::PersistentDirty, E::Detach) => S::DetachedClean,
        (
            S::PersistentDirty,
            E::ReadField { .. }
            | E::WriteField
            | E::Evict
            | E::MakePersistent
            | E::MakeTransactional
            | E::Attach,
        ) => S::PersistentDirty,

        (S::PersistentNew, E::DeletePersistent) => S::PersistentNewDeleted,
        (S::PersistentNew, E::Commit) => settled,
        (S::PersistentNew, E::Rollback) => S::Transient,
        (S::PersistentNew, E::Detach) => S::DetachedClean,
        (
            S::PersistentNew,
            E::ReadField { .. }
            | E::WriteField
            | E::Refresh
            | E::Evict
            | E::MakePersistent
            | E::MakeTransactional
            | E::Attach,
        ) => S::PersistentNew,

        (S::PersistentDeleted, E::ReadField { loaded: true }) => S::PersistentDeleted,
        (S::PersistentDeleted, E::Commit) => S::Transient,
        (S::PersistentDeleted, E::Rollback) => settled,
        (
            S::PersistentDeleted,
            E::DeletePersistent | E::Refresh | E::Evict | E::MakePersistent | E::MakeTransactional,
        ) => S::PersistentDeleted,

        (S::PersistentNewDeleted, E::ReadField { loaded: true }) => S::PersistentNewDeleted,
        (S::PersistentNewDeleted, E::Commit | E::Rollback) => S::Transient,
        (
            S::PersistentNewDeleted,
            E::DeletePersistent | E::Refresh | E::Evict | E::MakePersistent | E::MakeTransactional,
        ) => S::PersistentNewDeleted,

        (S::DetachedClean, E::WriteField) => S::DetachedDirty,
        (S::DetachedClean, E::ReadField { .. } | E::Detach) => S::DetachedClean,
        (S::DetachedDirty, E::ReadField { .. } | E::WriteField | E::Detach) => S::DetachedDirty,
        (S::DetachedClean | S::DetachedDirty, E::Attach | E::MakePersistent) => {
            S::PersistentClean
        }

        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleStage as S;

    const ALL_STAGES: [LifecycleStage; 10] = [
        S::Transient,
        S::TransientClean,
        S::Hollow,
        S::PersistentClean,
        S::PersistentDirty,
        S::PersistentNew,
        S::PersistentDeleted,
        S::PersistentNewDeleted,
        S::DetachedClean,
        S::DetachedDirty,
    ];

    fn step(stage: LifecycleStage, event: LifecycleEvent) -> Option<LifecycleStage> {
        transition(stage, event, TransitionOptions::default())
    }

    #[test]
    fn test_key_transitions() {
        assert_eq!(step(S::Transient, E::MakePersistent), Some(S::PersistentNew));
        assert_eq!(
            step(S::Hollow, E::ReadField { loaded: false }),
            Some(S::PersistentClean)
        );
        assert_eq!(step(S::PersistentClean, E::WriteField), Some(S::PersistentDirty));
        assert_eq!(
            step(S::PersistentNew, E::DeletePersistent),
            Some(S::PersistentNewDeleted)
        );
        assert_eq!(
            step(S::PersistentDirty, E::DeletePersistent),
            Some(S::PersistentDeleted)
        );
        assert_eq!(step(S::PersistentClean, E::Detach), Some(S::DetachedClean));
        assert_eq!(step(S::DetachedClean, E::WriteField), Some(S::DetachedDirty));
    }

    #[test]
    fn test_commit_respects_retain_values() {
        let retain = TransitionOptions {
            retain_values: true,
        };
        assert_eq!(step(S::PersistentDirty, E::Commit), Some(S::Hollow));
        assert_eq!(
            transition(S::PersistentDirty, E::Commit, retain),
            Some(S::PersistentClean)
        );
        assert_eq!(step(S::PersistentDeleted, E::Commit), Some(S::Transient));
        assert_eq!(step(S::PersistentNew, E::Rollback), Some(S::Transient));
    }

    #[test]
    fn test_illegal_transitions_are_undefined() {
        assert_eq!(step(S::Transient, E::DeletePersistent), None);
        assert_eq!(step(S::PersistentDeleted, E::WriteField), None);
        assert_eq!(step(S::PersistentDeleted, E::ReadField { loaded: false }), None);
        assert_eq!(
            step(S::PersistentDeleted, E::ReadField { loaded: true }),
            Some(S::PersistentDeleted)
        );
        assert_eq!(step(S::PersistentDirty, E::MakeTransient), None);
        assert_eq!(step(S::DetachedDirty, E::DeletePersistent), None);
    }

    #[test]
    fn test_commit_and_rollback_defined_for_every_managed_stage() {
        for stage in ALL_STAGES.iter().filter(|s| !s.is_detached()) {
            assert!(step(*stage, E::Commit).is_some(), "commit from {}", stage);
            assert!(step(*stage, E::Rollback).is_some(), "rollback from {}", stage);
        }
    }
}
