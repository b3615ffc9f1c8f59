use super::ClassMetadata;
use crate::core::FieldBitSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_GROUP: &str = "default";
pub const ALL_GROUP: &str = "all";

/// Named fetch groups active in an execution context, plus the depth limit
/// used when walking reference graphs (detach).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchPlan {
    groups: BTreeSet<String>,
    max_fetch_depth: i32,
}

impl FetchPlan {
    pub fn new() -> Self {
        Self {
            groups: BTreeSet::from([DEFAULT_GROUP.to_string()]),
            max_fetch_depth: 1,
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    pub fn add_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.groups.insert(group.into());
        self
    }

    pub fn remove_group(&mut self, group: &str) -> &mut Self {
        self.groups.remove(group);
        self
    }

    pub fn set_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.groups.clear();
        self.groups.insert(group.into());
        self
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// -1 means unlimited
    pub fn max_fetch_depth(&self) -> i32 {
        self.max_fetch_depth
    }

    pub fn set_max_fetch_depth(&mut self, depth: i32) -> &mut Self {
        self.max_fetch_depth = depth;
        self
    }

    /// Whether a reference found at `depth` (root object = 0) may still be followed
    pub fn within_depth(&self, depth: i32) -> bool {
        self.max_fetch_depth < 0 || depth <= self.max_fetch_depth
    }

    /// Fields of `class` selected by the active groups
    pub fn fields_for(&self, class: &ClassMetadata) -> FieldBitSet {
        if self.has_group(ALL_GROUP) {
            return class.all_fields();
        }
        let mut fields = FieldBitSet::new(class.field_count());
        for &pk in class.primary_key_fields() {
            fields.set(pk);
        }
        for group in &self.groups {
            if group == DEFAULT_GROUP {
                fields.union_with(class.default_fetch_group_fields());
            } else {
                fields.union_with(&class.fetch_group_fields(group));
            }
        }
        fields
    }
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self::new()
    }
}
