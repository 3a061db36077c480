//! Node configuration file
//!
//! Holds the forwarding switch and the node's forward rules. Every change is a
//! load-mutate-save cycle against the file, so the CLI and a running node can
//! both edit it.

use outpost_proto::{ForwardRuleDraft, RuleError, RuleId, RuleSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid node configuration: {0}")]
    Format(#[from] serde_json::Error),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Contents of the node configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default = "default_forwarding_enabled")]
    pub forwarding_enabled: bool,

    #[serde(default)]
    pub rules: RuleSet,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_forwarding_enabled() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            forwarding_enabled: default_forwarding_enabled(),
            rules: RuleSet::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfigStore {
    path: PathBuf,
}

impl NodeConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or empty file means the default configuration
    pub fn load(&self) -> Result<NodeConfig, ConfigError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(NodeConfig::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if json.trim().is_empty() {
            return Ok(NodeConfig::default());
        }
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, config: &NodeConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), "Saved node configuration");
        Ok(())
    }

    /// Load, apply `mutate`, and save only if it succeeded
    pub fn update<T>(
        &self,
        mutate: impl FnOnce(&mut NodeConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let mut config = self.load()?;
        let value = mutate(&mut config)?;
        self.save(&config)?;
        Ok(value)
    }

    pub fn add_rule(&self, draft: ForwardRuleDraft) -> Result<RuleId, ConfigError> {
        self.update(|config| Ok(config.rules.insert(draft)?))
    }

    pub fn remove_rule(&self, id: &RuleId) -> Result<(), ConfigError> {
        self.update(|config| {
            config.rules.remove(id)?;
            Ok(())
        })
    }

    pub fn set_rule_enabled(&self, id: &RuleId, enabled: bool) -> Result<(), ConfigError> {
        self.update(|config| Ok(config.rules.set_enabled(id, enabled)?))
    }

    pub fn set_forwarding_enabled(&self, enabled: bool) -> Result<(), ConfigError> {
        self.update(|config| {
            config.forwarding_enabled = enabled;
            Ok(())
        })
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
