//! Host configuration, loaded from YAML.

use anyhow::{Context, Result};
use bpmn_runtime_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Persistence backend for process state and context mappings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres { url: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    /// Directory of `.yaml` / `.json` definition documents deployed at startup.
    pub definitions_dir: PathBuf,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            definitions_dir: PathBuf::from("definitions"),
            log_filter: "info".to_string(),
        }
    }
}

impl HostConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmn_runtime_core::StrategyKind;

    #[test]
    fn nested_engine_section() {
        let config = HostConfig::from_yaml_str(
            "engine:\n  deployment_id: orders\n  strategy: per_process_instance\nstore:\n  kind: postgres\n  url: postgres://localhost/bpmn\n",
        )
        .unwrap();
        assert_eq!(config.engine.deployment_id, "orders");
        assert_eq!(config.engine.strategy, StrategyKind::PerProcessInstance);
        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                url: "postgres://localhost/bpmn".into()
            }
        );
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = HostConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.definitions_dir, PathBuf::from("definitions"));
    }
}
