use crate::core::{Result, TrackError};
use serde::{Deserialize, Serialize};

/// What happens when a second instance is tracked with a key that already
/// has an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityResolution {
    /// The existing entry wins; the new instance's values are discarded and
    /// every handle to it resolves to the canonical entity.
    #[default]
    Merge,
    /// Tracking fails with `DuplicateIdentity`.
    Reject,
}

/// When delete cascades and FK nulling reach tracked dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeTiming {
    /// As soon as the principal is marked for deletion.
    #[default]
    Immediate,
    /// At the start of the next save.
    OnSave,
}

/// Unit-of-work configuration
///
/// Passed explicitly to `DbContext::with_config`; there is no process-wide
/// default instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Conflict policy for duplicate identities
    pub identity_resolution: IdentityResolution,

    /// Run change detection automatically at the start of `save`
    pub auto_detect_changes: bool,

    /// Delete cascade timing
    pub cascade_delete_timing: CascadeTiming,

    /// Include property values in log events
    pub sensitive_data_logging: bool,

    /// Maximum depth of a single graph traversal
    pub max_graph_depth: usize,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self {
            identity_resolution: IdentityResolution::Merge,
            auto_detect_changes: true,
            cascade_delete_timing: CascadeTiming::Immediate,
            sensitive_data_logging: false,
            max_graph_depth: 256,
        }
    }

    pub fn identity_resolution(mut self, policy: IdentityResolution) -> Self {
        self.identity_resolution = policy;
        self
    }

    pub fn auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    pub fn cascade_delete_timing(mut self, timing: CascadeTiming) -> Self {
        self.cascade_delete_timing = timing;
        self
    }

    pub fn sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }

    pub fn max_graph_depth(mut self, depth: usize) -> Self {
        self.max_graph_depth = depth;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TrackError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_graph_depth == 0 {
            return Err(TrackError::Config("max_graph_depth must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContextConfig::default();
        assert_eq!(config.identity_resolution, IdentityResolution::Merge);
        assert!(config.auto_detect_changes);
        assert_eq!(config.cascade_delete_timing, CascadeTiming::Immediate);
        assert!(!config.sensitive_data_logging);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ContextConfig::new()
            .identity_resolution(IdentityResolution::Reject)
            .cascade_delete_timing(CascadeTiming::OnSave)
            .max_graph_depth(8);
        assert_eq!(config.identity_resolution, IdentityResolution::Reject);
        assert_eq!(config.cascade_delete_timing, CascadeTiming::OnSave);
        assert_eq!(config.max_graph_depth, 8);
    }

    #[test]
    fn test_from_json() {
        let config = ContextConfig::from_json(
            r#"{ "identity_resolution": "reject", "sensitive_data_logging": true }"#,
        )
        .unwrap();
        assert_eq!(config.identity_resolution, IdentityResolution::Reject);
        assert!(config.sensitive_data_logging);
        assert!(config.auto_detect_changes);

        assert!(ContextConfig::from_json(r#"{ "max_graph_depth": 0 }"#).is_err());
        assert!(ContextConfig::from_json("not json").is_err());
    }
}
