//! Configuration file parsing for the escrow orchestrator.
//!
//! Settings are read from a TOML file (`CONFIG_FILE`, default `escrow.toml`). Every
//! section is optional and falls back to defaults; a missing file yields the default
//! configuration. A few deployment-specific values can be overridden from the
//! environment (`ETHEREUM_NODE_URL`, `ETHEREUM_ADMIN_ADDRESS`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub node: NodeConfig,
    pub fees: FeeConfig,
    pub retry: RetryConfig,
    pub events: EventConfig,
    /// Registered contract types keyed by type name. Declaring any type replaces the
    /// default `escrow` entry.
    pub contracts: ContractsConfig,
}

impl EscrowConfig {
    /// Load configuration from a TOML file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    /// If the file exists but is malformed, returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        config.retry.validate()?;
        Ok(config)
    }

    /// Load configuration from `CONFIG_FILE` (or `escrow.toml`) and apply environment
    /// overrides.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "escrow.toml".to_string());
        Self::load(config_path)
    }

    /// [`EscrowConfig::from_file`] followed by environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let mut config = Self::from_file(path)?;
        if let Ok(url) = std::env::var("ETHEREUM_NODE_URL") {
            config.node.rpc_url = url;
        }
        if let Ok(admin) = std::env::var("ETHEREUM_ADMIN_ADDRESS") {
            config.node.admin_address = Some(admin);
        }
        Ok(config)
    }
}

/// Ledger node connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// JSON-RPC endpoint of the ledger node.
    pub rpc_url: String,

    /// Timeout for individual RPC requests in seconds.
    /// Default: 30 seconds.
    pub rpc_request_timeout_seconds: u64,

    /// HTTP connection establishment timeout in seconds.
    /// Default: 10 seconds.
    pub connection_timeout_seconds: u64,

    /// Maximum idle connections per host in the connection pool.
    pub pool_max_idle_per_host: usize,

    /// How long to keep idle connections alive in seconds.
    pub pool_idle_timeout_seconds: u64,

    /// Override alloy's default poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,

    /// Account that signs deployments and escrow calls.
    pub admin_address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            rpc_request_timeout_seconds: 30,
            connection_timeout_seconds: 10,
            pool_max_idle_per_host: 100,
            pool_idle_timeout_seconds: 90,
            poll_interval_ms: None,
            admin_address: None,
        }
    }
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_request_timeout_seconds)
    }
}

/// Fee estimation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Gas buffer multiplier applied to the node's estimate (1.2 = 20% headroom).
    pub gas_buffer: f64,

    /// External fee-market endpoint. When unset, the node's gas price is used directly.
    pub fee_market_url: Option<String>,

    /// Timeout for the fee-market request in milliseconds.
    pub fee_market_timeout_ms: u64,

    /// JSON field holding the suggested price.
    pub fee_market_field: String,

    /// The quote is expressed in gwei multiplied by this divisor (ethgasstation style).
    pub fee_market_divisor: u64,

    /// Minimum percentage increase of the gas price between attempts.
    pub replacement_bump_percent: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            gas_buffer: 1.2,
            fee_market_url: None,
            fee_market_timeout_ms: 3_000,
            fee_market_field: "fast".to_string(),
            fee_market_divisor: 10,
            replacement_bump_percent: 10,
        }
    }
}

impl FeeConfig {
    pub fn fee_market_timeout(&self) -> Duration {
        Duration::from_millis(self.fee_market_timeout_ms)
    }
}

/// Retry policy for state-changing calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts per call.
    pub max_retries: u32,
    /// Delay before the second attempt in seconds.
    pub retry_delay_seconds: u64,
    /// Multiplier applied to the delay after each failed attempt. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,
    /// How long to wait for a receipt per attempt.
    pub attempt_timeout_seconds: u64,
    /// Ceiling across the whole retry loop.
    pub overall_timeout_seconds: Option<u64>,
    pub receipt_poll_interval_ms: u64,
    /// Upper bound for any single backoff pause in seconds.
    pub max_retry_delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: 5,
            backoff_multiplier: 1.0,
            attempt_timeout_seconds: 120,
            overall_timeout_seconds: None,
            receipt_poll_interval_ms: 1_000,
            max_retry_delay_seconds: 300,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 0.0 {
            return Err(config::ConfigError::Message(format!(
                "retry.backoff_multiplier must be a finite non-negative number, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventConfig {
    /// Poll interval for log filters in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

impl EventConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Descriptor source and required interface for one contract type.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContractTypeConfig {
    /// Path to a JSON ABI array or an `{abi, bytecode}` artifact.
    pub descriptor_path: PathBuf,
    #[serde(default)]
    pub required_methods: Vec<String>,
    #[serde(default)]
    pub required_events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ContractsConfig(pub HashMap<String, ContractTypeConfig>);

impl Default for ContractsConfig {
    fn default() -> Self {
        let escrow = ContractTypeConfig {
            descriptor_path: PathBuf::from("abi/Escrow.json"),
            required_methods: ["release", "withdraw", "terminate"].map(String::from).to_vec(),
            required_events: ["FundsReleased", "FundsWithdrawn", "ContractTerminated"]
                .map(String::from)
                .to_vec(),
        };
        Self(HashMap::from([("escrow".to_string(), escrow)]))
    }
}
