use std::{env, time::Duration};

use alloy::primitives::Address;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use submitter_core::{chain::ChainConfig, constants::*};
use submitter_executors::{
    block_watcher::{BlockWatcherConfig, TransportConfig},
    nonce_queue::NonceQueueConfig,
    receipt::ReceiptResolverConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub chain: ChainSection,
    pub executors: ExecutorsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub receipts: ReceiptsConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub metrics_port: u16,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            metrics_port: 9090,
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSection {
    pub chain_id: u64,
    #[serde(default)]
    pub ws_urls: Vec<String>,
    #[serde(default)]
    pub http_urls: Vec<String>,
    pub entry_point: Address,
}

impl ChainSection {
    /// Websocket endpoints first, each list in configured order.
    pub fn to_chain_config(&self) -> ChainConfig {
        ChainConfig {
            chain_id: self.chain_id,
            rpc_urls: self
                .ws_urls
                .iter()
                .chain(self.http_urls.iter())
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorsConfig {
    /// Hex encoded private keys of the executor accounts.
    pub private_keys: Vec<String>,
    #[serde(default = "default_assignment_ttl_ms")]
    pub assignment_ttl_ms: u64,
}

impl ExecutorsConfig {
    pub fn assignment_ttl(&self) -> Duration {
        Duration::from_millis(self.assignment_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_pending_per_track: usize,
    pub max_total_pending: usize,
    pub max_in_flight: usize,
    pub max_pending_time_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_track: DEFAULT_MAX_PENDING_PER_TRACK,
            max_total_pending: DEFAULT_MAX_TOTAL_PENDING,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_pending_time_ms: DEFAULT_MAX_PENDING_TIME.as_millis() as u64,
        }
    }
}

impl From<&QueueConfig> for NonceQueueConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_pending_per_track: config.max_pending_per_track,
            max_total_pending: config.max_total_pending,
            max_in_flight: config.max_in_flight,
            max_pending_time: Duration::from_millis(config.max_pending_time_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub max_attempts_per_url: u32,
    pub connect_retry_delay_ms: u64,
    pub polling_interval_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    /// How long startup waits for the first block before giving up.
    pub initial_block_wait_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_url: DEFAULT_MAX_ATTEMPTS_PER_URL,
            connect_retry_delay_ms: DEFAULT_CONNECT_RETRY_DELAY.as_millis() as u64,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL.as_millis() as u64,
            watchdog_timeout_ms: DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u64,
            restart_backoff_ms: DEFAULT_RESTART_BACKOFF.as_millis() as u64,
            initial_block_wait_ms: DEFAULT_INITIAL_BLOCK_WAIT.as_millis() as u64,
        }
    }
}

impl MonitoringConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_attempts_per_url: self.max_attempts_per_url,
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
        }
    }

    pub fn watcher(&self) -> BlockWatcherConfig {
        BlockWatcherConfig {
            watchdog_timeout: Duration::from_millis(self.watchdog_timeout_ms),
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
        }
    }

    pub fn initial_block_wait(&self) -> Duration {
        Duration::from_millis(self.initial_block_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiptsConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub last_ditch_timeout_ms: u64,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RECEIPT_TIMEOUT.as_millis() as u64,
            retries: DEFAULT_RECEIPT_RETRIES,
            retry_delay_ms: DEFAULT_RECEIPT_RETRY_DELAY.as_millis() as u64,
            last_ditch_timeout_ms: DEFAULT_RECEIPT_LAST_DITCH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ReceiptsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolver(&self) -> ReceiptResolverConfig {
        ReceiptResolverConfig {
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            last_ditch_timeout: Duration::from_millis(self.last_ditch_timeout_ms),
        }
    }
}

fn default_assignment_ttl_ms() -> u64 {
    DEFAULT_ASSIGNMENT_TTL.as_millis() as u64
}

pub fn get_config() -> Result<SubmitterConfig, ConfigError> {
    let base_path = env::current_dir()
        .map_err(|e| ConfigError::Message(format!("Failed to determine the current directory: {e}")))?;
    let configuration_directory = base_path.join("configuration");

    // Detect the running environment
    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    // Load configuration from files
    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(
            config::Environment::with_prefix("app")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("chain.ws_urls")
                .with_list_parse_key("chain.http_urls")
                .with_list_parse_key("executors.private_keys")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize::<SubmitterConfig>()
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local`, `development`, or `production`."
            )),
        }
    }
}
