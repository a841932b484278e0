//! Engine configuration, loaded from YAML. Every field has a default, so an
//! empty document is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session binding policy for a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One shared session for the lifetime of the deployment.
    #[default]
    Singleton,
    /// One session per live process instance.
    PerProcessInstance,
    /// A fresh session for every call.
    PerRequest,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StrategyKind::Singleton => "singleton",
            StrategyKind::PerProcessInstance => "per_process_instance",
            StrategyKind::PerRequest => "per_request",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespaces context mappings and session records in a shared store.
    pub deployment_id: String,
    pub strategy: StrategyKind,
    /// Upper bound on state machine steps per operation. Exceeding it is an
    /// execution failure (runaway loop).
    pub max_steps_per_operation: usize,
    /// Fallback wake-up interval of the timer driver.
    pub timer_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployment_id: "default".to_string(),
            strategy: StrategyKind::default(),
            max_steps_per_operation: 10_000,
            timer_poll_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn with_strategy(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Parsing engine config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_yaml_str("strategy: per_process_instance\n").unwrap();
        assert_eq!(config.strategy, StrategyKind::PerProcessInstance);
        assert_eq!(config.max_steps_per_operation, 10_000);
        assert_eq!(config.deployment_id, "default");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(EngineConfig::from_yaml_str("strategy: per_tenant\n").is_err());
    }
}
