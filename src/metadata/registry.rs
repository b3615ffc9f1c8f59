// ============================================================================
// Enhancement Registry
// ============================================================================
//
// Process-wide table of persistable classes: resolved metadata plus a
// factory for blank instances. It is created once at startup, handed to the
// persistence unit by reference, and torn down explicitly. Lookups after
// teardown fail with a configuration error.
//
// ============================================================================

use super::ClassMetadata;
use crate::core::{PersistenceError, Result};
use crate::state::{Persistable, PersistableClass};
use crate::types::TypeRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

#[derive(Clone)]
struct RegisteredClass {
    metadata: Arc<ClassMetadata>,
    factory: fn() -> Box<dyn Persistable>,
}

pub struct EnhancementRegistry {
    classes: RwLock<HashMap<&'static str, RegisteredClass>>,
    types: Arc<TypeRegistry>,
    active: AtomicBool,
}

impl EnhancementRegistry {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            types,
            active: AtomicBool::new(true),
        }
    }

    /// Registry with the built-in type registry
    pub fn init() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(TypeRegistry::new())))
    }

    /// Drop every registration. The registry refuses further lookups.
    pub fn teardown(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.classes.write()?.clear();
        event!(Level::DEBUG, "enhancement registry torn down");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(PersistenceError::Configuration(
                "Enhancement registry has been torn down".into(),
            ))
        }
    }

    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Register class `T`, resolving its metadata against the type registry.
    pub fn register<T: PersistableClass>(&self) -> Result<Arc<ClassMetadata>> {
        self.ensure_active()?;
        let metadata = Arc::new(T::class_metadata().resolve(&self.types)?);
        let mut classes = self.classes.write()?;
        if let Some(existing) = classes.get(T::CLASS_NAME) {
            return Ok(existing.metadata.clone());
        }
        classes.insert(
            T::CLASS_NAME,
            RegisteredClass {
                metadata: metadata.clone(),
                factory: T::new_boxed,
            },
        );
        event!(
            Level::DEBUG,
            class = T::CLASS_NAME,
            fields = metadata.field_count(),
            "class registered"
        );
        Ok(metadata)
    }

    pub fn is_registered(&self, class: &str) -> bool {
        self.classes
            .read()
            .map(|classes| classes.contains_key(class))
            .unwrap_or(false)
    }

    pub fn metadata(&self, class: &str) -> Result<Arc<ClassMetadata>> {
        self.ensure_active()?;
        self.classes
            .read()?
            .get(class)
            .map(|c| c.metadata.clone())
            .ok_or_else(|| PersistenceError::UnknownClass(class.to_string()))
    }

    pub fn new_instance(&self, class: &str) -> Result<Box<dyn Persistable>> {
        self.ensure_active()?;
        let factory = self
            .classes
            .read()?
            .get(class)
            .map(|c| c.factory)
            .ok_or_else(|| PersistenceError::UnknownClass(class.to_string()))?;
        Ok(factory())
    }

    /// `class` equals `ancestor` or extends it, directly or transitively
    pub fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        let Ok(classes) = self.classes.read() else {
            return false;
        };
        let mut current = Some(class);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = classes.get(name).and_then(|c| c.metadata.parent);
        }
        false
    }

    pub fn class_names(&self) -> Vec<&'static str> {
        self.classes
            .read()
            .map(|classes| classes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The field on the other side of a bidirectional relation, if any.
    ///
    /// A field with `mapped_by` names its inverse directly; an owning field is
    /// matched by the target class field whose `mapped_by` points back at it.
    pub fn inverse_field(&self, class: &str, field: usize) -> Option<(Arc<ClassMetadata>, usize)> {
        let source = self.metadata(class).ok()?;
        let fmd = source.field_meta(field)?;
        let target = self.metadata(fmd.target?).ok()?;
        let inverse = match fmd.mapped_by {
            Some(name) => target.field_number(name)?,
            None => target.fields.iter().position(|f| {
                f.mapped_by == Some(fmd.name) && f.target.is_some_and(|t| self.is_subclass(class, t))
            })?,
        };
        Some((target, inverse))
    }
}

impl std::fmt::Debug for EnhancementRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancementRegistry")
            .field("classes", &self.class_names())
            .field("active", &self.is_active())
            .finish()
    }
}
