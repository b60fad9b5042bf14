//! Courier configuration system.
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./courier.yaml` (current directory - highest priority)
//! 2. `~/.config/courier/courier.yaml` (user config directory)
//! 3. `/etc/courier/courier.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. The YAML structure mirrors the section names:
//!
//! ```yaml
//! node:
//!   port: 5000
//! transfer:
//!   chunk_size: 1150
//!   window_size: 64
//! fec:
//!   enabled: true
//! custody:
//!   next_hop: "10.0.0.2:5000"
//! ```

mod node;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use node::{
    CustodyConfig, FecConfig, NodeConfig, ReleasePolicy, StorageConfig, TransferConfig,
};

/// Default config filename.
const CONFIG_FILENAME: &str = "courier.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and endpoint (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Transfer parameters (`transfer.*`).
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Forward error correction (`fec.*`).
    #[serde(default)]
    pub fec: FecConfig,

    /// Custody handoff (`custody.*`).
    #[serde(default)]
    pub custody: CustodyConfig,

    /// Persistent store (`storage.*`).
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns the
    /// merged config and the paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths, later paths overriding
    /// earlier ones. Missing files are skipped.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        config.validate()?;
        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/courier").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("courier").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Scalar values from `other` override values in `self` whenever they
    /// differ from the defaults; optional values override when present.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.node.port != defaults.node.port {
            self.node.port = other.node.port;
        }
        if other.node.node_id.is_some() {
            self.node.node_id = other.node.node_id;
        }

        if other.transfer.chunk_size != defaults.transfer.chunk_size {
            self.transfer.chunk_size = other.transfer.chunk_size;
        }
        if other.transfer.window_size != defaults.transfer.window_size {
            self.transfer.window_size = other.transfer.window_size;
        }
        if other.transfer.base_rto_ms != defaults.transfer.base_rto_ms {
            self.transfer.base_rto_ms = other.transfer.base_rto_ms;
        }
        if other.transfer.max_rto_ms != defaults.transfer.max_rto_ms {
            self.transfer.max_rto_ms = other.transfer.max_rto_ms;
        }
        if other.transfer.ttl_sec != defaults.transfer.ttl_sec {
            self.transfer.ttl_sec = other.transfer.ttl_sec;
        }

        if other.fec.enabled {
            self.fec.enabled = true;
        }
        if other.fec.k != defaults.fec.k {
            self.fec.k = other.fec.k;
        }
        if other.fec.r != defaults.fec.r {
            self.fec.r = other.fec.r;
        }

        if other.custody.max_retries != defaults.custody.max_retries {
            self.custody.max_retries = other.custody.max_retries;
        }
        if other.custody.backoff_base_sec != defaults.custody.backoff_base_sec {
            self.custody.backoff_base_sec = other.custody.backoff_base_sec;
        }
        if other.custody.backoff_cap_sec != defaults.custody.backoff_cap_sec {
            self.custody.backoff_cap_sec = other.custody.backoff_cap_sec;
        }
        if other.custody.release_policy != defaults.custody.release_policy {
            self.custody.release_policy = other.custody.release_policy;
        }
        if other.custody.next_hop.is_some() {
            self.custody.next_hop = other.custody.next_hop;
        }

        if other.storage.db_path.is_some() {
            self.storage.db_path = other.storage.db_path;
        }
        if other.storage.cap_bytes.is_some() {
            self.storage.cap_bytes = other.storage.cap_bytes;
        }
        if other.storage.retain_sec != defaults.storage.retain_sec {
            self.storage.retain_sec = other.storage.retain_sec;
        }
        if other.storage.inbox_dir != defaults.storage.inbox_dir {
            self.storage.inbox_dir = other.storage.inbox_dir;
        }
    }

    /// Reject configurations that cannot produce valid datagrams.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > crate::protocol::MAX_DATA_PAYLOAD
        {
            return Err(ConfigError::InvalidValue(format!(
                "transfer.chunk_size must be 1..={}, got {}",
                crate::protocol::MAX_DATA_PAYLOAD,
                self.transfer.chunk_size
            )));
        }
        if self.transfer.window_size == 0 {
            return Err(ConfigError::InvalidValue(
                "transfer.window_size must be at least 1".into(),
            ));
        }
        if self.fec.enabled && (self.fec.k == 0 || self.fec.r == 0) {
            return Err(ConfigError::InvalidValue(format!(
                "fec.k and fec.r must be non-zero when fec.enabled, got k={} r={}",
                self.fec.k, self.fec.r
            )));
        }
        Ok(())
    }

    /// Effective node id: configured value or the hostname.
    pub fn node_id(&self) -> String {
        self.node
            .node_id
            .clone()
            .unwrap_or_else(|| {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            })
    }

    /// Database directory for this node.
    pub fn db_path(&self) -> PathBuf {
        match &self.storage.db_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(format!("courier_{}_{}.db", self.node_id(), self.node.port)),
        }
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
