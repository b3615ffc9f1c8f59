pub mod lifecycle;
pub mod manager;
pub mod persistable;
pub mod slot;

pub use lifecycle::{LifecycleEvent, LifecycleStage, TransitionOptions, transition};
pub use manager::{Activity, EmbeddedOwner, StateManager};
pub use persistable::{Persistable, PersistableClass};
pub use slot::{AccessFlags, DetachedState, EngineKey, InstanceId, StateSlot};

/// Stage of an arbitrary instance as far as it can tell by itself: detached
/// instances carry their own state, everything else not managed is transient.
pub fn stage_of_unmanaged(object: &dyn Persistable) -> LifecycleStage {
    match object.state_slot().detached_state() {
        Some(detached) if detached.is_dirty() => LifecycleStage::DetachedDirty,
        Some(_) => LifecycleStage::DetachedClean,
        None => LifecycleStage::Transient,
    }
}
