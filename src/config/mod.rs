//! Manager configuration
//!
//! Loaded from a YAML or JSON file (picked by extension, YAML otherwise).

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bgp::{Peer, BGP_PORT};
use crate::queue::BackoffConfig;

/// Default config file location: ~/.bgplb/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bgplb")
        .join("config.yaml")
}

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One upstream router to peer with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    pub asn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Passed through to the protocol engine untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl PeerConfig {
    pub fn new(address: impl Into<String>, asn: u32) -> Self {
        Self {
            address: address.into(),
            asn,
            port: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn to_peer(&self) -> Result<Peer, ConfigError> {
        let address: IpAddr = self.address.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!("peer address '{}' is not an IP", self.address))
        })?;

        let mut peer = Peer::new(address, self.asn);
        peer.attributes = self.attributes.clone();
        peer.attributes.insert(
            "port".to_string(),
            self.port.unwrap_or(BGP_PORT).to_string(),
        );
        Ok(peer)
    }
}

fn default_workers() -> usize {
    1
}

fn default_sync_timeout_secs() -> u64 {
    10
}

/// Reconciler and peering configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub local_asn: u32,
    /// Concurrent reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound for a single announcer call
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Retries before a key is given up on; 0 retries forever
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_asn: 0,
            workers: default_workers(),
            sync_timeout_secs: default_sync_timeout_secs(),
            max_retries: 0,
            backoff: BackoffConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync_timeout_secs must be at least 1".into(),
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base delay {}ms exceeds max delay {}ms",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.asn == 0 {
                return Err(ConfigError::Invalid(format!(
                    "peer '{}' has ASN 0",
                    peer.address
                )));
            }
            let parsed = peer.to_peer()?;
            if !seen.insert(parsed.address) {
                return Err(ConfigError::Invalid(format!(
                    "peer '{}' is configured twice",
                    peer.address
                )));
            }
        }
        Ok(())
    }

    /// Configured peers, in file order
    pub fn peers(&self) -> Result<Vec<Peer>, ConfigError> {
        self.peers.iter().map(PeerConfig::to_peer).collect()
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Load and validate a config file, expanding a leading `~`
pub fn load_config_file(path: &Path) -> Result<ManagerConfig, ConfigError> {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let path = Path::new(&expanded);
    let content = std::fs::read_to_string(path)?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => ManagerConfig::from_json_str(&content),
        _ => ManagerConfig::from_yaml_str(&content),
    }
}
