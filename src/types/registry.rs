// ============================================================================
// Type Registry
// ============================================================================
//
// Answers the per-type questions the engine asks about a field: persistent
// by default, in the default fetch group by default, embedded by default,
// whether it needs a tracked wrapper, and which converter applies.
//
// ============================================================================

use super::converter::{BooleanYnConverter, TypeConverter, UuidStringConverter};
use crate::core::{FieldType, FieldValue};
use crate::metadata::FieldMetadata;
use std::collections::HashMap;
use std::sync::Arc;

/// Wrapper kind installed for second-class mutable values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
    List,
    Map,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub field_type: FieldType,
    pub default_persistent: bool,
    pub default_fetch_group: bool,
    pub default_embedded: bool,
    pub wrapper: Option<WrapperKind>,
}

impl TypeInfo {
    fn simple(field_type: FieldType) -> Self {
        Self {
            field_type,
            default_persistent: true,
            default_fetch_group: true,
            default_embedded: true,
            wrapper: None,
        }
    }
}

pub struct TypeRegistry {
    types: HashMap<FieldType, TypeInfo>,
    converters: HashMap<String, Arc<dyn TypeConverter>>,
    auto_apply: HashMap<FieldType, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
            converters: HashMap::new(),
            auto_apply: HashMap::new(),
        };

        for ft in [
            FieldType::Boolean,
            FieldType::Byte,
            FieldType::Char,
            FieldType::Short,
            FieldType::Int,
            FieldType::Long,
            FieldType::Float,
            FieldType::Double,
            FieldType::Text,
            FieldType::Timestamp,
            FieldType::Uuid,
        ] {
            registry.types.insert(ft, TypeInfo::simple(ft));
        }

        registry.types.insert(
            FieldType::Reference,
            TypeInfo {
                field_type: FieldType::Reference,
                default_persistent: true,
                default_fetch_group: false,
                default_embedded: false,
                wrapper: None,
            },
        );
        for (ft, wrapper) in [
            (FieldType::List, None),
            (FieldType::Map, None),
            (FieldType::TrackedList, Some(WrapperKind::List)),
            (FieldType::TrackedMap, Some(WrapperKind::Map)),
        ] {
            registry.types.insert(
                ft,
                TypeInfo {
                    field_type: ft,
                    default_persistent: true,
                    default_fetch_group: false,
                    default_embedded: false,
                    wrapper,
                },
            );
        }
        registry.types.insert(
            FieldType::Any,
            TypeInfo {
                field_type: FieldType::Any,
                default_persistent: true,
                default_fetch_group: false,
                default_embedded: false,
                wrapper: None,
            },
        );

        registry.register_converter(Arc::new(BooleanYnConverter), None);
        registry.register_converter(Arc::new(UuidStringConverter), None);
        registry
    }

    pub fn type_info(&self, field_type: FieldType) -> Option<&TypeInfo> {
        self.types.get(&field_type)
    }

    pub fn is_default_persistent(&self, field_type: FieldType) -> bool {
        self.type_info(field_type)
            .map(|t| t.default_persistent)
            .unwrap_or(false)
    }

    pub fn is_default_fetch_group(&self, field_type: FieldType) -> bool {
        self.type_info(field_type)
            .map(|t| t.default_fetch_group)
            .unwrap_or(false)
    }

    pub fn is_default_embedded(&self, field_type: FieldType) -> bool {
        self.type_info(field_type)
            .map(|t| t.default_embedded)
            .unwrap_or(false)
    }

    pub fn is_second_class_mutable(&self, field_type: FieldType) -> bool {
        self.wrapper_for(field_type).is_some()
    }

    pub fn wrapper_for(&self, field_type: FieldType) -> Option<WrapperKind> {
        self.type_info(field_type).and_then(|t| t.wrapper)
    }

    /// Register a converter under its name, optionally applying it to every
    /// field of `auto_apply` type that does not name its own converter.
    pub fn register_converter(
        &mut self,
        converter: Arc<dyn TypeConverter>,
        auto_apply: Option<FieldType>,
    ) {
        let name = converter.name().to_string();
        if let Some(ft) = auto_apply {
            self.auto_apply.insert(ft, name.clone());
        }
        self.converters.insert(name, converter);
    }

    pub fn converter(&self, name: &str) -> Option<Arc<dyn TypeConverter>> {
        self.converters.get(name).cloned()
    }

    pub fn default_converter(&self, field_type: FieldType) -> Option<Arc<dyn TypeConverter>> {
        self.auto_apply
            .get(&field_type)
            .and_then(|name| self.converter(name))
    }

    /// Converter for a field: explicitly named first, then auto-applied by type
    pub fn converter_for_field(&self, field: &FieldMetadata) -> Option<Arc<dyn TypeConverter>> {
        match field.converter {
            Some(name) => self.converter(name),
            None => self.default_converter(field.field_type),
        }
    }

    /// Installs the tracked wrapper a field type calls for.
    pub fn wrap_value(&self, field_type: FieldType, value: FieldValue) -> FieldValue {
        match (self.wrapper_for(field_type), value) {
            (Some(WrapperKind::List), FieldValue::List(items)) => {
                FieldValue::TrackedList(super::TrackedList::from_value(items))
            }
            (Some(WrapperKind::Map), FieldValue::Map(entries)) => {
                FieldValue::TrackedMap(super::TrackedMap::from_value(entries))
            }
            (_, value) => value,
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let registry = TypeRegistry::new();
        assert!(registry.is_default_fetch_group(FieldType::Text));
        assert!(!registry.is_default_fetch_group(FieldType::Reference));
        assert!(!registry.is_default_fetch_group(FieldType::TrackedList));
        assert!(registry.is_second_class_mutable(FieldType::TrackedMap));
        assert!(!registry.is_second_class_mutable(FieldType::List));
        assert!(registry.is_default_embedded(FieldType::Long));
    }

    #[test]
    fn test_auto_apply_converter() {
        let mut registry = TypeRegistry::new();
        assert!(registry.default_converter(FieldType::Uuid).is_none());
        registry.register_converter(Arc::new(UuidStringConverter), Some(FieldType::Uuid));
        assert_eq!(
            registry.default_converter(FieldType::Uuid).unwrap().name(),
            "uuid-string"
        );
        assert!(registry.converter("boolean-yn").is_some());
    }

    #[test]
    fn test_wrap_value() {
        let registry = TypeRegistry::new();
        let wrapped = registry.wrap_value(FieldType::TrackedList, FieldValue::List(vec![]));
        assert!(matches!(wrapped, FieldValue::TrackedList(_)));
        let plain = registry.wrap_value(FieldType::List, FieldValue::List(vec![]));
        assert!(matches!(plain, FieldValue::List(_)));
    }
}
