use crate::state::{LifecycleEvent, LifecycleStage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Cannot apply '{event}' to object {object} in stage {stage}")]
    IllegalTransition {
        object: String,
        stage: LifecycleStage,
        event: LifecycleEvent,
    },

    #[error("Object {0} has been deleted")]
    ObjectDeleted(String),

    #[error("Value assigned to field '{field}' of {object} is already owned by {owner}")]
    OwnershipConflict {
        object: String,
        field: String,
        owner: String,
    },

    #[error("Object {0} is managed by a different execution context")]
    ForeignContext(String),

    #[error("Field '{field}' not found in class '{class}'")]
    UnknownField { class: String, field: String },

    #[error("Class '{0}' is not registered")]
    UnknownClass(String),

    #[error("Field '{field}' of {object} is not available (not loaded before deletion)")]
    FieldNotAvailable { object: String, field: String },

    #[error("Field '{field}' of detached object {object} was not detached")]
    DetachedFieldAccess { object: String, field: String },

    #[error("Cannot change primary key field '{field}' of persistent object {object}")]
    IdentityChange { object: String, field: String },

    #[error("An object with identity {0} is already managed by this context")]
    DuplicateObject(String),

    #[error("Object handle {0} is not valid in this context")]
    InvalidHandle(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("{0}")]
    User(String),

    #[error("Object {object} cannot be flushed yet: it references {pending} which has no identity")]
    NotYetFlushed { object: String, pending: String },

    #[error("Object {0} not found in datastore")]
    ObjectNotFound(String),

    #[error("Optimistic lock conflict for {object}: expected version {expected}, found {found}")]
    OptimisticConflict {
        object: String,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Datastore(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistenceError {
    /// Illegal API use by the caller. Never retried.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalTransition { .. }
                | Self::ObjectDeleted(_)
                | Self::OwnershipConflict { .. }
                | Self::ForeignContext(_)
                | Self::UnknownField { .. }
                | Self::UnknownClass(_)
                | Self::FieldNotAvailable { .. }
                | Self::DetachedFieldAccess { .. }
                | Self::IdentityChange { .. }
                | Self::DuplicateObject(_)
                | Self::InvalidHandle(_)
                | Self::TypeMismatch { .. }
                | Self::User(_)
        )
    }

    /// Forward reference that will resolve on a later flush.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotYetFlushed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PersistenceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
