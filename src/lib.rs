// ============================================================================
// memorm Library
// ============================================================================
//
// Object persistence core: managed objects move through a lifecycle state
// machine inside an execution context, field reads and writes are mediated
// so that lazy loading and dirty tracking happen transparently, and the
// datastore is reached through a pluggable persistence handler.
//
// ============================================================================

extern crate self as memorm;

pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod fieldmanager;
pub mod metadata;
pub mod prelude;
pub mod relationship;
pub mod state;
pub mod store;
pub mod types;

pub use memorm_derive::Persistable;

pub use cache::{CacheStats, CachedSnapshot, Level2Cache};
pub use config::{DetachPolicy, PersistenceConfig};
pub use context::{
    CallbackEvent, ExecutionContext, LifecycleListener, ListenerContext, PersistenceUnit,
    SharedExecutionContext, TransactionId,
};
pub use core::{
    FieldType, FieldValue, KeyValue, ObjectHandle, ObjectId, ObjectRef, PersistenceError, Result,
    Version,
};
pub use engine::{DetachedGraph, FieldSelector, ValueSource};
pub use metadata::{
    ClassMetadata, EnhancementRegistry, FetchPlan, FieldMetadata, IdentityStrategy,
    ValueStrategy, VersionStrategy,
};
pub use state::{LifecycleEvent, LifecycleStage, Persistable, PersistableClass, StateSlot};
pub use store::{MemoryPersistenceHandler, PersistenceHandler};
pub use types::{TrackedList, TrackedMap, TypeConverter, TypeRegistry};
