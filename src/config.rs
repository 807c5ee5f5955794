//! Configuration management for TuCoin

use crate::consensus::pow::MAX_DIFFICULTY;
use crate::consensus::ConsensusKind;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Host advertised in our node id; detected from the routing table when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            p2p_port: default_p2p_port(),
            advertise_host: None,
            bootstrap_peers: Vec::new(),
            io_timeout_secs: default_io_timeout(),
            max_message_bytes: default_max_message_bytes(),
            max_concurrent_sends: default_max_concurrent_sends(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            offline_threshold_secs: default_offline_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            sync_interval_secs: default_sync_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl NetworkConfig {
    /// Loopback-only settings with short intervals, for tests and local devnets.
    pub fn local(port: u16) -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            p2p_port: port,
            advertise_host: Some("127.0.0.1".to_string()),
            io_timeout_secs: 2,
            heartbeat_interval_secs: 1,
            offline_threshold_secs: 3,
            sweep_interval_secs: 1,
            sync_interval_secs: 2,
            ..Self::default()
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_discovery_port(),
            interval_secs: default_discovery_interval(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// `pow` or `pos`.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_min_stake")]
    pub min_stake: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            difficulty: default_difficulty(),
            min_stake: default_min_stake(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_mining_interval")]
    pub interval_secs: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            interval_secs: default_mining_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            autosave_interval_secs: default_autosave_interval(),
        }
    }
}

impl Config {
    /// Reject combinations the node cannot run with.
    pub fn validate(&self) -> Result<(), ChainError> {
        let net = &self.network;
        if net.heartbeat_interval_secs == 0
            || net.sweep_interval_secs == 0
            || net.sync_interval_secs == 0
            || net.io_timeout_secs == 0
        {
            return Err(ChainError::ConfigError(
                "network intervals and timeouts must be non-zero".to_string(),
            ));
        }
        if net.heartbeat_interval_secs >= net.offline_threshold_secs {
            return Err(ChainError::ConfigError(format!(
                "network.heartbeat_interval_secs ({}) must be below offline_threshold_secs ({})",
                net.heartbeat_interval_secs, net.offline_threshold_secs
            )));
        }
        if net.max_concurrent_sends == 0 {
            return Err(ChainError::ConfigError(
                "network.max_concurrent_sends must be at least 1".to_string(),
            ));
        }
        if net.event_buffer == 0 {
            return Err(ChainError::ConfigError(
                "network.event_buffer must be at least 1".to_string(),
            ));
        }

        if self.discovery.enabled && self.discovery.interval_secs == 0 {
            return Err(ChainError::ConfigError(
                "discovery.interval_secs must be non-zero".to_string(),
            ));
        }

        self.consensus.algorithm.parse::<ConsensusKind>()?;
        if self.consensus.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty ({}) must be at most {}",
                self.consensus.difficulty, MAX_DIFFICULTY
            )));
        }

        if self.miner.enabled && self.miner.address.trim().is_empty() {
            return Err(ChainError::ConfigError(
                "miner.address must be set when the miner is enabled".to_string(),
            ));
        }
        if self.miner.enabled && self.miner.interval_secs == 0 {
            return Err(ChainError::ConfigError(
                "miner.interval_secs must be non-zero".to_string(),
            ));
        }

        if self.storage.snapshot_path.is_empty() {
            return Err(ChainError::ConfigError(
                "storage.snapshot_path must be set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read `./config.toml`, falling back to defaults when the file is absent.
pub fn load_config() -> Result<Config, ChainError> {
    load_config_from("config.toml")
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    let config: Config = if path.exists() {
        let config_str = fs::read_to_string(path)?;
        toml::from_str(&config_str)?
    } else {
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    5000
}

fn default_io_timeout() -> u64 {
    5
}

fn default_max_message_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_max_concurrent_sends() -> usize {
    16
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_offline_threshold() -> u64 {
    90
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    256
}

fn default_enabled() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    5500
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_algorithm() -> String {
    "pow".to_string()
}

fn default_difficulty() -> u32 {
    4
}

fn default_min_stake() -> f64 {
    100.0
}

fn default_mining_interval() -> u64 {
    10
}

fn default_snapshot_path() -> String {
    "data/blockchain.json".to_string()
}

fn default_autosave_interval() -> u64 {
    60
}
