use serde::{Deserialize, Serialize};

/// Field selection used when detaching an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachPolicy {
    /// Every persistent field, loading what is missing
    All,
    /// Only the fields currently loaded
    Loaded,
    /// The fields selected by the active fetch plan
    #[default]
    FetchGroups,
}

/// Persistence unit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Optimistic transactions; datastore operations are delayed to commit
    pub optimistic: bool,

    /// Delay datastore operations until flush/commit in datastore transactions
    pub delay_datastore_operations: bool,

    /// Keep field values loaded after commit instead of going hollow
    pub retain_values: bool,

    /// Restore saved field values on rollback
    pub restore_values: bool,

    /// Allow reads outside a transaction
    pub nontransactional_read: bool,

    /// Allow writes outside a transaction (each one auto-commits)
    pub nontransactional_write: bool,

    pub detach_state: DetachPolicy,

    /// Load fetch-plan fields that are missing when detaching
    pub detach_load_fields: bool,

    /// Leave out loaded fields that are not in the fetch plan when detaching
    pub detach_unload_fields: bool,

    /// Reference depth followed by detach; -1 is unbounded
    pub max_fetch_depth: i32,

    pub l2_cache_enabled: bool,

    /// Entry limit of the second-level cache; `None` is unbounded
    pub l2_max_size: Option<usize>,

    /// Cache embedded objects inline with their owner
    pub cache_embedded: bool,

    /// Keep both ends of bidirectional relations consistent at flush
    pub manage_relationships: bool,

    /// Reject contradicting assignments to both ends of a relation
    pub manage_relationship_checks: bool,

    /// Assume detached objects being attached come from this datastore
    pub attach_same_datastore: bool,

    /// Execution contexts may be shared between threads
    pub multithreaded: bool,
}

impl PersistenceConfig {
    pub fn new() -> Self {
        Self {
            optimistic: false,
            delay_datastore_operations: false,
            retain_values: false,
            restore_values: true,
            nontransactional_read: true,
            nontransactional_write: true,
            detach_state: DetachPolicy::FetchGroups,
            detach_load_fields: true,
            detach_unload_fields: true,
            max_fetch_depth: 1,
            l2_cache_enabled: true,
            l2_max_size: None,
            cache_embedded: true,
            manage_relationships: true,
            manage_relationship_checks: true,
            attach_same_datastore: true,
            multithreaded: false,
        }
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    pub fn delay_datastore_operations(mut self, delay: bool) -> Self {
        self.delay_datastore_operations = delay;
        self
    }

    pub fn retain_values(mut self, retain: bool) -> Self {
        self.retain_values = retain;
        self
    }

    pub fn restore_values(mut self, restore: bool) -> Self {
        self.restore_values = restore;
        self
    }

    pub fn nontransactional_read(mut self, allowed: bool) -> Self {
        self.nontransactional_read = allowed;
        self
    }

    pub fn nontransactional_write(mut self, allowed: bool) -> Self {
        self.nontransactional_write = allowed;
        self
    }

    pub fn detach_state(mut self, policy: DetachPolicy) -> Self {
        self.detach_state = policy;
        self
    }

    pub fn detach_load_fields(mut self, load: bool) -> Self {
        self.detach_load_fields = load;
        self
    }

    pub fn detach_unload_fields(mut self, unload: bool) -> Self {
        self.detach_unload_fields = unload;
        self
    }

    pub fn max_fetch_depth(mut self, depth: i32) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    pub fn l2_cache(mut self, enabled: bool) -> Self {
        self.l2_cache_enabled = enabled;
        self
    }

    pub fn l2_max_size(mut self, max: usize) -> Self {
        self.l2_max_size = Some(max);
        self
    }

    pub fn cache_embedded(mut self, cache: bool) -> Self {
        self.cache_embedded = cache;
        self
    }

    pub fn manage_relationships(mut self, manage: bool) -> Self {
        self.manage_relationships = manage;
        self
    }

    pub fn manage_relationship_checks(mut self, check: bool) -> Self {
        self.manage_relationship_checks = check;
        self
    }

    pub fn attach_same_datastore(mut self, same: bool) -> Self {
        self.attach_same_datastore = same;
        self
    }

    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    /// Datastore operations wait for flush/commit
    pub fn delays_datastore_operations(&self) -> bool {
        self.optimistic || self.delay_datastore_operations
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid configuration: {}", e))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| e.to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_fetch_depth < -1 {
            return Err("max_fetch_depth must be -1 (unbounded) or >= 0".to_string());
        }

        if self.l2_max_size == Some(0) && self.l2_cache_enabled {
            return Err("l2_max_size must be > 0 when the level 2 cache is enabled".to_string());
        }

        if self.manage_relationship_checks && !self.manage_relationships {
            return Err("manage_relationship_checks requires manage_relationships".to_string());
        }

        Ok(())
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PersistenceConfig::default();
        assert!(!config.optimistic);
        assert!(!config.retain_values);
        assert!(config.restore_values);
        assert_eq!(config.detach_state, DetachPolicy::FetchGroups);
        assert_eq!(config.max_fetch_depth, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = PersistenceConfig::new()
            .optimistic(true)
            .retain_values(true)
            .l2_max_size(100)
            .detach_state(DetachPolicy::Loaded);

        assert!(config.delays_datastore_operations());
        assert!(config.retain_values);
        assert_eq!(config.l2_max_size, Some(100));
        assert_eq!(config.detach_state, DetachPolicy::Loaded);
    }

    #[test]
    fn test_json_fills_missing_keys_with_defaults() {
        let config = PersistenceConfig::from_json(r#"{"optimistic": true, "detach_state": "all"}"#)
            .unwrap();
        assert!(config.optimistic);
        assert_eq!(config.detach_state, DetachPolicy::All);
        assert!(config.l2_cache_enabled);

        let back = PersistenceConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_config() {
        assert!(PersistenceConfig::new().max_fetch_depth(-5).validate().is_err());
        assert!(PersistenceConfig::new().l2_max_size(0).validate().is_err());
        assert!(
            PersistenceConfig::new()
                .manage_relationships(false)
                .validate()
                .is_err()
        );
        assert!(
            PersistenceConfig::new()
                .manage_relationships(false)
                .manage_relationship_checks(false)
                .validate()
                .is_ok()
        );
    }
}
