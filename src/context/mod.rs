// ============================================================================
// Persistence Unit and Execution Context
// ============================================================================
//
// A PersistenceUnit binds configuration, the enhancement registry, one
// persistence handler and the shared second-level cache. It opens execution
// contexts, the per-session unit of work. An execution context owns:
//
// - the object arena (every managed instance and its StateManager)
// - the L1 cache, identity -> handle
// - the current transaction and the dirty list
// - the fetch plan and the relationship manager
//
// The lifecycle operations on a context live in the engine module.
//
// ============================================================================

pub mod arena;
pub mod listener;
pub(crate) mod provider;
pub mod transaction;

pub use arena::{ManagedSlot, ObjectArena};
pub use listener::{CallbackEvent, LifecycleListener, ListenerContext};
pub use transaction::{Transaction, TransactionId, TransactionState};

use crate::cache::Level2Cache;
use crate::config::PersistenceConfig;
use crate::core::{ContextId, ObjectHandle, ObjectId, PersistenceError, Result};
use crate::metadata::{ClassMetadata, EnhancementRegistry, FetchPlan};
use crate::relationship::RelationshipManager;
use crate::state::PersistableClass;
use crate::store::PersistenceHandler;
use crate::types::TypeRegistry;
use crate::types::tracked::ContainerJournal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{Level, event};

pub struct PersistenceUnit {
    config: PersistenceConfig,
    registry: Arc<EnhancementRegistry>,
    handler: Arc<dyn PersistenceHandler>,
    l2: Option<Arc<Level2Cache>>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl PersistenceUnit {
    pub fn new(
        config: PersistenceConfig,
        handler: Arc<dyn PersistenceHandler>,
        registry: Arc<EnhancementRegistry>,
    ) -> Result<Self> {
        config.validate().map_err(PersistenceError::Configuration)?;
        if !registry.is_active() {
            return Err(PersistenceError::Configuration(
                "Enhancement registry has been torn down".into(),
            ));
        }
        let l2 = config
            .l2_cache_enabled
            .then(|| Arc::new(Level2Cache::new(config.l2_max_size, registry.clone())));
        event!(
            Level::INFO,
            handler = handler.name(),
            l2 = l2.is_some(),
            optimistic = config.optimistic,
            "persistence unit created"
        );
        Ok(Self {
            config,
            registry,
            handler,
            l2,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EnhancementRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<dyn PersistenceHandler> {
        &self.handler
    }

    pub fn level2_cache(&self) -> Option<&Arc<Level2Cache>> {
        self.l2.as_ref()
    }

    pub fn register<T: PersistableClass>(&self) -> Result<Arc<ClassMetadata>> {
        self.registry.register::<T>()
    }

    /// Listeners apply to contexts opened afterwards
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> Result<()> {
        self.listeners.write()?.push(listener);
        Ok(())
    }

    pub fn open_context(&self) -> Result<ExecutionContext> {
        let listeners = self.listeners.read()?.clone();
        Ok(ExecutionContext::new(
            self.config.clone(),
            self.registry.clone(),
            self.handler.clone(),
            self.l2.clone(),
            listeners,
        ))
    }

    /// Context that several threads may use in turn
    pub fn open_shared_context(&self) -> Result<SharedExecutionContext> {
        if !self.config.multithreaded {
            return Err(PersistenceError::Configuration(
                "shared contexts require multithreaded = true".into(),
            ));
        }
        Ok(SharedExecutionContext::new(self.open_context()?))
    }
}

impl fmt::Debug for PersistenceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceUnit")
            .field("handler", &self.handler.name())
            .field("l2", &self.l2.is_some())
            .finish()
    }
}

pub struct ExecutionContext {
    pub(crate) id: ContextId,
    pub(crate) config: PersistenceConfig,
    pub(crate) registry: Arc<EnhancementRegistry>,
    pub(crate) handler: Arc<dyn PersistenceHandler>,
    pub(crate) l2: Option<Arc<Level2Cache>>,
    pub(crate) arena: ObjectArena,
    pub(crate) l1: HashMap<ObjectId, ObjectHandle>,
    pub(crate) txn: Option<Transaction>,
    pub(crate) fetch_plan: FetchPlan,
    /// Taken out while relationships are being processed
    pub(crate) relationships: Option<RelationshipManager>,
    pub(crate) listeners: Vec<Arc<dyn LifecycleListener>>,
    pub(crate) dirty: Vec<ObjectHandle>,
    pub(crate) dirty_set: HashSet<ObjectHandle>,
    /// Containers mutated in place since the last flush
    pub(crate) containers: ContainerJournal,
    /// Nesting of multi-step operations; nontransactional work is flushed
    /// when the outermost one finishes
    pub(crate) batch_depth: u32,
    pub(crate) flushing: bool,
    pub(crate) closed: bool,
}

impl ExecutionContext {
    pub(crate) fn new(
        config: PersistenceConfig,
        registry: Arc<EnhancementRegistry>,
        handler: Arc<dyn PersistenceHandler>,
        l2: Option<Arc<Level2Cache>>,
        listeners: Vec<Arc<dyn LifecycleListener>>,
    ) -> Self {
        let mut fetch_plan = FetchPlan::new();
        fetch_plan.set_max_fetch_depth(config.max_fetch_depth);
        let relationships = config
            .manage_relationships
            .then(|| RelationshipManager::new(config.manage_relationship_checks));
        let id = ContextId::next();
        event!(Level::DEBUG, context = %id, "execution context opened");
        Self {
            id,
            config,
            registry,
            handler,
            l2,
            arena: ObjectArena::new(),
            l1: HashMap::new(),
            txn: None,
            fetch_plan,
            relationships,
            listeners,
            dirty: Vec::new(),
            dirty_set: HashSet::new(),
            containers: ContainerJournal::default(),
            batch_depth: 0,
            flushing: false,
            closed: false,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EnhancementRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<dyn PersistenceHandler> {
        &self.handler
    }

    pub fn level2_cache(&self) -> Option<&Arc<Level2Cache>> {
        self.l2.as_ref()
    }

    pub fn fetch_plan(&self) -> &FetchPlan {
        &self.fetch_plan
    }

    pub fn fetch_plan_mut(&mut self) -> &mut FetchPlan {
        &mut self.fetch_plan
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    pub fn is_transaction_active(&self) -> bool {
        self.txn.as_ref().is_some_and(Transaction::is_active)
    }

    pub(crate) fn transaction_id(&self) -> Option<TransactionId> {
        self.txn.as_ref().filter(|t| t.is_active()).map(Transaction::id)
    }

    pub fn relationship_manager(&self) -> Option<&RelationshipManager> {
        self.relationships.as_ref()
    }

    pub(crate) fn types(&self) -> &TypeRegistry {
        self.registry.type_registry()
    }

    /// Handle of the object with identity `id`, if this context manages it
    pub fn handle_of(&self, id: &ObjectId) -> Option<ObjectHandle> {
        self.l1.get(id).copied().filter(|h| self.arena.contains(*h))
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.arena.contains(handle)
    }

    /// Number of managed objects, embedded ones included
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.arena.handles()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(PersistenceError::User(format!(
                "Execution context {} is closed",
                self.id
            )))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("objects", &self.arena.len())
            .field("transaction", &self.txn.as_ref().map(Transaction::id))
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

/// Execution context behind a mutex. The guard releases the context when it
/// goes out of scope, also on early return and panic.
#[derive(Clone)]
pub struct SharedExecutionContext {
    inner: Arc<Mutex<ExecutionContext>>,
}

impl SharedExecutionContext {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ExecutionContext>> {
        Ok(self.inner.lock()?)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> Result<R>) -> Result<R> {
        let mut guard = self.lock()?;
        f(&mut guard)
    }
}

impl fmt::Debug for SharedExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExecutionContext").finish_non_exhaustive()
    }
}
