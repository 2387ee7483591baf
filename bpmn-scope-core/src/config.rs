//! Engine configuration, loaded from YAML.
//!
//! ```yaml
//! partition_id: 1
//! max_message_size: 4194304
//! ancestor_state_policy: activated_only
//! multi_tenancy: false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{LifecycleState, MAX_PARTITION_ID};

// ---------------------------------------------------------------------------
// Ancestor eligibility
// ---------------------------------------------------------------------------

/// Which lifecycle states make an existing scope eligible as the explicit
/// ancestor of a modification activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AncestorStatePolicy {
    /// Only ACTIVATED scopes. Scopes stuck in ACTIVATING (e.g. on an
    /// incident) are rejected.
    #[default]
    ActivatedOnly,
    ActivatingOrActivated,
}

impl AncestorStatePolicy {
    pub fn allows(&self, state: LifecycleState) -> bool {
        match self {
            Self::ActivatedOnly => state == LifecycleState::Activated,
            Self::ActivatingOrActivated => state.is_active(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Encoded into the upper bits of every generated key.
    pub partition_id: u16,
    /// Shared transport limit for one command and for one batch of records, in bytes.
    pub max_message_size: usize,
    pub max_tags: usize,
    pub ancestor_state_policy: AncestorStatePolicy,
    /// Upper bound of internal follow-up commands processed for one inbound command.
    pub max_commands_per_batch: usize,
    /// Buffer of the broadcast event sink.
    pub event_sink_capacity: usize,
    /// When enabled, commands are checked against the caller's authorized tenants.
    pub multi_tenancy: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            max_message_size: 4 * 1024 * 1024,
            max_tags: 10,
            ancestor_state_policy: AncestorStatePolicy::default(),
            max_commands_per_batch: 10_000,
            event_sink_capacity: 1024,
            multi_tenancy: false,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml).context("Parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Loading {}", path.display()))
    }

    /// Checked on every load; call it directly for configs built in code.
    pub fn validate(&self) -> Result<()> {
        if self.partition_id > MAX_PARTITION_ID {
            anyhow::bail!(
                "partition_id must be at most {MAX_PARTITION_ID}, got {}",
                self.partition_id
            );
        }
        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be greater than zero");
        }
        if self.max_commands_per_batch == 0 {
            anyhow::bail!("max_commands_per_batch must be greater than zero");
        }
        if self.event_sink_capacity == 0 {
            anyhow::bail!("event_sink_capacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_tags, 10);
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let config = EngineConfig::from_yaml_str(
            "partition_id: 3\nancestor_state_policy: activating_or_activated\nmax_message_size: 2048\n",
        )
        .unwrap();
        assert_eq!(config.partition_id, 3);
        assert_eq!(config.max_message_size, 2048);
        assert!(config
            .ancestor_state_policy
            .allows(LifecycleState::Activating));
    }

    #[test]
    fn unknown_keys_and_zero_limits_are_rejected() {
        assert!(EngineConfig::from_yaml_str("partition: 1").is_err());
        assert!(EngineConfig::from_yaml_str("max_message_size: 0").is_err());
    }

    #[test]
    fn partition_id_must_leave_room_for_positive_keys() {
        let highest = format!("partition_id: {MAX_PARTITION_ID}");
        assert_eq!(EngineConfig::from_yaml_str(&highest).unwrap().partition_id, MAX_PARTITION_ID);

        let err = EngineConfig::from_yaml_str("partition_id: 4096").unwrap_err();
        assert!(format!("{err:#}").contains("partition_id must be at most 4095"));
        let config = EngineConfig {
            partition_id: u16::MAX,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_policy_requires_activated() {
        let policy = AncestorStatePolicy::default();
        assert!(policy.allows(LifecycleState::Activated));
        assert!(!policy.allows(LifecycleState::Activating));
        assert!(!policy.allows(LifecycleState::Terminating));
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/engine.yaml"));
    }
}
