//! Node configuration: the YAML-loaded options of spec.md §6, with their
//! documented defaults. The RPC server, CLI driver and file logger that
//! consume these options are out of scope; this crate only owns parsing
//! and defaulting.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_port() -> u16 {
    8080
}
fn default_rpc_port() -> u16 {
    8545
}
fn default_rpc_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_chain_id() -> u64 {
    1337
}
fn default_block_gas_limit() -> u64 {
    8_000_000
}
fn default_max_peers() -> usize {
    50
}
fn default_cache() -> usize {
    256
}
fn default_handles() -> usize {
    256
}
fn default_verbosity() -> u8 {
    3
}
fn default_rate_limit() -> usize {
    100
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Recognized options and their defaults, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,

    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_block_gas_limit")]
    pub block_gas_limit: u64,

    pub mining: bool,
    #[serde(default)]
    pub miner: String,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default)]
    pub boot_nodes: Vec<String>,

    #[serde(default = "default_cache")]
    pub cache: usize,
    #[serde(default = "default_handles")]
    pub handles: usize,

    #[serde(default = "default_verbosity")]
    pub verbosity: u8,

    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            data_dir: default_data_dir(),
            port: default_port(),
            rpc_port: default_rpc_port(),
            rpc_addr: default_rpc_addr(),
            chain_id: default_chain_id(),
            block_gas_limit: default_block_gas_limit(),
            mining: false,
            miner: String::new(),
            max_peers: default_max_peers(),
            boot_nodes: Vec::new(),
            cache: default_cache(),
            handles: default_handles(),
            verbosity: default_verbosity(),
            enable_rate_limit: true,
            rate_limit: default_rate_limit(),
            rate_limit_window_secs: default_rate_limit_window(),
            health_check_interval_secs: default_health_check_interval(),
            enable_metrics: true,
        }
    }
}

impl NodeConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn chaindata_dir(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    pub fn wallet_dir(&self) -> PathBuf {
        self.data_dir.join("wallet")
    }

    /// Loads and parses `path` as YAML. A missing file is not defaulted
    /// silently here; the caller (`bin/node`) decides whether a missing
    /// config file means "use defaults" or is itself an error.
    pub fn load(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
        let bytes = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
