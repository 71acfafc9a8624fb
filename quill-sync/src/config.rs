//! Server configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working in-memory server on `127.0.0.1:9090`.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! heartbeat_timeout_secs = 60
//!
//! [documents]
//! max_history = 5000
//! idle_retention_secs = 0
//!
//! [storage]
//! path = "/var/lib/quill"
//! sync_writes = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::storage::StoreConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub documents: DocumentConfig,
    pub storage: StoreConfig,
}

/// Network-facing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// A connection silent for this long is closed
    pub heartbeat_timeout_secs: u64,
    /// How often idle documents are swept from memory
    pub eviction_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_timeout_secs: 60,
            eviction_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Per-document limits and lifecycle policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Operations retained for transforming late arrivals
    pub max_history: usize,
    /// Largest `version - baseVersion` gap folded before forcing a resync
    pub max_transform_window: usize,
    /// How long an idle document stays in memory (0 = evict on last leave)
    pub idle_retention_secs: u64,
    /// Joins beyond this are refused
    pub max_participants_per_document: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            max_transform_window: 1000,
            idle_retention_secs: 300,
            max_participants_per_document: 100,
        }
    }
}

impl DocumentConfig {
    pub fn idle_retention(&self) -> Duration {
        Duration::from_secs(self.idle_retention_secs)
    }
}

impl Config {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "server.broadcast_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.server.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "server.heartbeat_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.server.eviction_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "server.eviction_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.documents.max_participants_per_document == 0 {
            return Err(ConfigError::Invalid {
                field: "documents.max_participants_per_document",
                reason: "must be at least 1".into(),
            });
        }
        if self.documents.max_transform_window > self.documents.max_history {
            return Err(ConfigError::Invalid {
                field: "documents.max_transform_window",
                reason: format!(
                    "{} exceeds max_history ({})",
                    self.documents.max_transform_window, self.documents.max_history
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.server.broadcast_capacity, 256);
        assert_eq!(config.documents.max_history, 1000);
        assert_eq!(config.documents.max_participants_per_document, 100);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.heartbeat_timeout_secs, 60);
        assert_eq!(config.documents.idle_retention_secs, 300);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:7000"

            [documents]
            idle_retention_secs = 0

            [storage]
            path = "/tmp/quill-db"
            sync_writes = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.broadcast_capacity, 256);
        assert_eq!(config.documents.idle_retention(), Duration::ZERO);
        assert_eq!(config.documents.max_history, 1000);
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/quill-db")));
        assert!(config.storage.sync_writes);
    }

    #[test]
    fn test_window_larger_than_history_rejected() {
        let err = Config::from_toml_str(
            r#"
            [documents]
            max_history = 10
            max_transform_window = 50
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "documents.max_transform_window", .. }
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::from_toml_str("[server]\nbroadcast_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("[server\nbind_addr = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        std::fs::write(&path, "[documents]\nmax_participants_per_document = 2\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.documents.max_participants_per_document, 2);
    }
}
