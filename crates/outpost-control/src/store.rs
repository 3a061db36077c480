//! Relay configuration persistence
//!
//! The node catalog lives inside the relay's configuration document. Writers
//! always load the current document, replace the node list and save it back,
//! so keys owned by other components survive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Configuration store unavailable: {0}")]
    Unavailable(String),
}

/// Catalog entry for a certificate that has been online at least once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredNode {
    pub certificate_id: String,
    pub display_name: String,
    #[serde(default)]
    pub remark: String,
    /// Certificate organization
    #[serde(default)]
    pub account: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub registered_ip: String,
    #[serde(default)]
    pub last_online_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_offline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_address: Option<String>,
}

/// Relay configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfigFile {
    #[serde(default)]
    pub nodes: Vec<RegisteredNode>,

    /// Keys this crate does not own
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Load/save access to the relay configuration
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<RelayConfigFile, StoreError>;
    fn save(&self, config: &RelayConfigFile) -> Result<(), StoreError>;
}

/// JSON document on disk, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<RelayConfigFile, StoreError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RelayConfigFile::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        if json.trim().is_empty() {
            return Ok(RelayConfigFile::default());
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, config: &RelayConfigFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// In-memory store, with switches to make loads or saves fail
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<RelayConfigFile>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RelayConfigFile) -> Self {
        Self {
            config: Mutex::new(config),
            ..Self::default()
        }
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RelayConfigFile {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayConfigFile> {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<RelayConfigFile, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("load disabled".to_string()));
        }
        Ok(self.lock().clone())
    }

    fn save(&self, config: &RelayConfigFile) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("save disabled".to_string()));
        }
        *self.lock() = config.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(id: &str) -> RegisteredNode {
        RegisteredNode {
            certificate_id: id.to_string(),
            display_name: format!("{id}-name"),
            remark: String::new(),
            account: "acme".to_string(),
            registered_at: Utc::now(),
            registered_ip: "203.0.113.7".to_string(),
            last_online_at: None,
            last_offline_at: None,
            last_address: None,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("relay.json"));
        assert_eq!(store.load().unwrap(), RelayConfigFile::default());
    }

    #[test]
    fn test_save_keeps_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("relay.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"listen":"0.0.0.0:8443","nodes":[]}"#).unwrap();

        let store = JsonFileStore::new(&path);
        let mut config = store.load().unwrap();
        config.nodes.push(node("cA"));
        store.save(&config).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["listen"], "0.0.0.0:8443");
        assert_eq!(raw["nodes"][0]["certificateId"], "cA");
        assert!(!path.with_extension("json.tmp").exists());

        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn test_corrupt_file_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Format(_))));
    }

    #[test]
    fn test_memory_store_failure_switches() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        assert!(store.save(&RelayConfigFile::default()).is_err());
        assert_eq!(store.save_count(), 0);

        store.set_fail_saves(false);
        store.set_fail_loads(true);
        assert!(store.load().is_err());
        assert!(store.save(&RelayConfigFile::default()).is_ok());
        assert_eq!(store.save_count(), 1);
    }
}
