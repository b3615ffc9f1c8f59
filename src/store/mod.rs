pub mod change;
pub mod handler;
pub mod memory;

pub use change::Change;
pub use handler::{KeyQuery, ObjectProvider, PersistenceHandler, StoredObject};
pub use memory::{HandlerStats, MemoryPersistenceHandler, StoredRow};
