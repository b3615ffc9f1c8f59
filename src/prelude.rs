//! Everything a domain model and its application code usually needs.
//!
//! `use memorm::prelude::*;` brings in the derive, the context types and the
//! value types used by mediated field access.

pub use crate::Persistable;
pub use crate::config::{DetachPolicy, PersistenceConfig};
pub use crate::context::{
    CallbackEvent, ExecutionContext, LifecycleListener, ListenerContext, PersistenceUnit,
};
pub use crate::core::{
    FieldValue, ObjectHandle, ObjectId, ObjectRef, PersistenceError, Result, Version,
};
pub use crate::engine::{DetachedGraph, FieldSelector};
pub use crate::metadata::EnhancementRegistry;
pub use crate::state::{LifecycleStage, PersistableClass, StateSlot};
pub use crate::store::MemoryPersistenceHandler;
pub use crate::types::{TrackedList, TrackedMap};

pub mod advanced {
    //! Engine internals for handlers and tooling built on top of the core.
    pub use crate::fieldmanager::FieldManager;
    pub use crate::metadata::{ClassMetadata, FieldMetadata, IdentityStrategy, VersionStrategy};
    pub use crate::state::{LifecycleEvent, StateManager, transition};
    pub use crate::store::{ObjectProvider, PersistenceHandler, StoredObject};
    pub use crate::types::{TypeConverter, TypeRegistry};
}
