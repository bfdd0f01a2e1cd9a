use std::{path::Path, time::Duration};

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::storage::RollupWriteMode;

pub const ENV_PREFIX: &str = "ROLLUPD";

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RollupdConfig {
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    /// queue (topic) name
    pub name: String,
    /// shared subscription group, consumers in the same group split the queue
    pub group: String,
    /// prefix for per worker client ids, defaults to `<group>_<hostname>`.
    /// Must stay the same across restarts for sessions to be resumed.
    pub client_id: Option<String>,
    /// max unacknowledged deliveries per worker
    pub credit_window: usize,
    /// `None` requeues malformed deliveries forever
    pub max_redeliveries: Option<u32>,
    /// defaults to `<name>.dead`
    pub dead_letter: Option<String>,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// `None` lets a write block forever
    pub write_timeout_ms: Option<u64>,
    pub rollup_mode: RollupWriteMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    /// replace workers that failed
    pub restart: bool,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// per slot, `None` is unlimited
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// ex. `0.0.0.0:3000`, `None` disables the http api
    pub listen: Option<String>,
    pub recent_limit: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("pool needs at least one worker")]
    NoWorkers,
    #[error("queue name cannot be empty")]
    EmptyQueueName,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            name: "hello".to_string(),
            group: "rollupd".to_string(),
            client_id: None,
            credit_window: 10_000,
            max_redeliveries: None,
            dead_letter: None,
            keep_alive_secs: 5,
            username: None,
            password: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./rollupd.sqlite".to_string(),
            write_timeout_ms: None,
            rollup_mode: RollupWriteMode::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            restart: true,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            max_restarts: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: None,
            recent_limit: 1000,
        }
    }
}

impl QueueConfig {
    pub fn subscription(&self) -> String {
        format!("$share/{}/{}", self.group, self.name)
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.group, hostname()))
    }

    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter
            .clone()
            .unwrap_or_else(|| format!("{}.dead", self.name))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl StorageConfig {
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

impl RollupdConfig {
    /// Reads an optional RON file, then `ROLLUPD__SECTION__KEY` env vars on top.
    pub fn load(file_path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = Config::builder()
            .add_source(File::from(file_path).format(FileFormat::Ron).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = Config::builder()
            .add_source(File::from_str(s, FileFormat::Ron))
            .build()?
            .try_deserialize()?;
        cfg.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue.name.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        Ok(self)
    }
}
