pub mod level2;
pub mod snapshot;

pub use level2::{CacheStats, Level2Cache};
pub use snapshot::CachedSnapshot;
