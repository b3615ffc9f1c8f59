pub mod class;
pub mod fetch;
pub mod registry;

pub use class::{ClassMetadata, FieldMetadata, IdentityStrategy, ValueStrategy, VersionStrategy};
pub use fetch::{ALL_GROUP, DEFAULT_GROUP, FetchPlan};
pub use registry::EnhancementRegistry;
