pub mod converter;
pub mod registry;
pub mod tracked;

pub use converter::{BooleanYnConverter, TypeConverter, UuidStringConverter};
pub use registry::{TypeInfo, TypeRegistry, WrapperKind};
pub use tracked::{OwnerLink, Tracked, TrackedList, TrackedMap};
