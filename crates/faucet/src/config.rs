//! Faucet configuration

use crate::error::{FaucetError, FaucetResult};
use drip_common::utils::config::load_config_with_env;
use drip_common::utils::logging::LoggingConfig;
use drip_core::{ActionTimeoutPolicy, AuthLevel, PoolOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `DRIP_DB_PATH` or `DRIP__POOL__RETRY_WAIT_MS`
pub const ENV_PREFIX: &str = "DRIP";

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetConfig {
    /// HTTP API address
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Sled database path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Timing of every network's account pool
    #[serde(default)]
    pub pool: PoolOptions,

    /// Per-network parameters, keyed by network name
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

/// Request worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Interval between scans of each network's request collection
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Requests processed at once across all networks
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Parameters of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint of a node
    pub node_url: String,

    /// Queried from the node when absent
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Native amount (wei) for unauthenticated requests
    pub faucet_amount: String,

    /// Stable token amount (wei) for unauthenticated requests
    pub faucet_stable_amount: String,

    pub authenticated_amount: String,

    pub authenticated_stable_amount: String,

    #[serde(default)]
    pub stable_tokens: Vec<StableToken>,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    #[serde(default = "default_token_gas_limit")]
    pub token_gas_limit: u64,

    /// Wei per gas. Queried from the node when absent.
    #[serde(default)]
    pub gas_price: Option<String>,

    /// Wait for each transaction to be mined before reporting its hash
    #[serde(default = "default_wait_for_receipt")]
    pub wait_for_receipt: bool,

    /// Use the account pool of another network
    #[serde(default)]
    pub account_namespace: Option<String>,

    #[serde(default)]
    pub big_faucet: Option<SafeFundingConfig>,
}

/// Scheduled top-up of a large faucet safe from the account pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeFundingConfig {
    pub safe_address: String,

    /// Native amount (wei) per top-up
    pub amount: String,

    /// Amount (wei) of every stable token per top-up
    pub stables_amount: String,

    /// Lease timing of the top-up. Longer than a request's by default.
    #[serde(default = "default_safe_funding_pool")]
    pub pool: PoolOptions,
}

/// ERC-20 token sent alongside the native transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableToken {
    pub symbol: String,
    pub address: String,
}

/// Amounts sent for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAmounts {
    pub native: String,
    pub stable: String,
}

fn default_server_addr() -> String { "0.0.0.0:3000".to_string() }
fn default_db_path() -> String { "./drip_data".to_string() }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_concurrent_requests() -> usize { 16 }
fn default_gas_limit() -> u64 { 21_000 }
fn default_token_gas_limit() -> u64 { 100_000 }
fn default_wait_for_receipt() -> bool { true }
fn default_safe_funding_pool() -> PoolOptions { PoolOptions::new(4_000, 30_000, 120_000) }

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            db_path: default_db_path(),
            logging: LoggingConfig::default(),
            worker: WorkerConfig::default(),
            pool: PoolOptions::default(),
            networks: BTreeMap::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl FaucetConfig {
    /// Loads a config file with `DRIP__SECTION__KEY` overrides layered on top.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config: Self = load_config_with_env(path, ENV_PREFIX)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus the flat `DRIP_*` environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("DRIP_SERVER_ADDR") {
            self.server_addr = addr;
        }

        if let Ok(db_path) = std::env::var("DRIP_DB_PATH") {
            self.db_path = db_path;
        }

        if let Ok(level) = std::env::var("DRIP_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("DRIP_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(interval) = std::env::var("DRIP_POLL_INTERVAL_MS") {
            self.worker.poll_interval_ms = interval.parse().unwrap_or(self.worker.poll_interval_ms);
        }

        if let Ok(max) = std::env::var("DRIP_MAX_CONCURRENT_REQUESTS") {
            self.worker.max_concurrent_requests = max.parse().unwrap_or(self.worker.max_concurrent_requests);
        }

        if let Ok(policy) = std::env::var("DRIP_ON_ACTION_TIMEOUT") {
            match policy.to_lowercase().as_str() {
                "cancel" => self.pool.on_action_timeout = ActionTimeoutPolicy::Cancel,
                "detach" => self.pool.on_action_timeout = ActionTimeoutPolicy::Detach,
                _ => {}
            }
        }
    }

    pub fn get_network(&self, network: &str) -> FaucetResult<&NetworkConfig> {
        self.networks
            .get(network)
            .ok_or_else(|| FaucetError::UnknownNetwork(network.to_string()))
    }

    /// Namespace holding the accounts used by `network`
    pub fn account_namespace<'a>(&'a self, network: &'a str) -> FaucetResult<&'a str> {
        let config = self.get_network(network)?;
        Ok(config.account_namespace.as_deref().unwrap_or(network))
    }
}

impl NetworkConfig {
    pub fn amounts_for(&self, auth_level: AuthLevel) -> SendAmounts {
        match auth_level {
            AuthLevel::None => SendAmounts {
                native: self.faucet_amount.clone(),
                stable: self.faucet_stable_amount.clone(),
            },
            AuthLevel::Authenticated => SendAmounts {
                native: self.authenticated_amount.clone(),
                stable: self.authenticated_stable_amount.clone(),
            },
        }
    }
}
