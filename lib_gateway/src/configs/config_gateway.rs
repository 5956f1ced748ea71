//! # Gateway Configuration
//!
//! Settings are layered, later sources winning field by field:
//!
//! 1. built-in defaults;
//! 2. the JSON file `server_gateway.conf` (or `--config-path`);
//! 3. environment variables (`GATEWAY_*`, `.env` honoured) and CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::dispatcher::{HubConfig, TokenValidator};

const DEFAULT_CONFIG_FILE: &str = "server_gateway.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("invalid command line: {0}")]
    Cli(#[from] clap::Error),
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[clap(about = "Realtime gateway hub", version)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[clap(long, env = "GATEWAY_PORT", help = "Port to listen on for WebSocket and HTTP clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "GATEWAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_REDIS_URL", help = "Redis URL for cluster fan-out and statistics.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "GATEWAY_INSTANCE_ID", help = "Identity of this instance on the cluster bus. Random when unset.")]
    pub instance_id: Option<String>,

    #[clap(long, env = "GATEWAY_CHANNEL_PREFIX", help = "Prefix of the public/admin bus channels.")]
    pub channel_prefix: Option<String>,

    #[clap(long, env = "GATEWAY_STATS_PREFIX", help = "Key prefix of the daily statistics in Redis.")]
    pub stats_prefix: Option<String>,

    #[clap(long, env = "GATEWAY_ADMIN_TOKEN", help = "Credential accepted on the admin channel. Unset rejects every admin.")]
    pub admin_token: Option<String>,

    #[clap(long, env = "GATEWAY_LOG_DIR", help = "Directory for the daily rolling log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_PREFIX", help = "File name prefix of the rolling log files.")]
    pub log_prefix: Option<String>,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "GATEWAY_QUEUE_CAPACITY", help = "Capacity of the dispatch queue.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "GATEWAY_OUTBOUND_BUFFER", help = "Frames buffered per connection before new ones are dropped.")]
    pub outbound_buffer: Option<usize>,

    #[clap(long, env = "GATEWAY_ENQUEUE_TIMEOUT_MS", help = "Milliseconds a producer waits on a full dispatch queue.")]
    pub enqueue_timeout_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_STATS_TIMEOUT_MS", help = "Upper bound in milliseconds for each statistics update.")]
    pub stats_timeout_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_BUS_RETRY_DELAY_MS", help = "Milliseconds between cluster bus resubscribe attempts.")]
    pub bus_retry_delay_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_LOG_BUFFER_FRAMES", help = "Log frames buffered per admin log tail.")]
    pub log_buffer_frames: Option<usize>,

    #[clap(long, env = "GATEWAY_LOG_CHUNK_BYTES", help = "Chunk size in bytes when replaying log files.")]
    pub log_chunk_bytes: Option<usize>,
}

impl GatewayConfig {
    /// Built-in defaults. `instance_id` and `admin_token` stay unset.
    pub fn defaults() -> GatewayConfig {
        GatewayConfig {
            port: Some(3002),
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            channel_prefix: Some("gateway".to_string()),
            stats_prefix: Some("gateway:stats".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_prefix: Some("server_gateway".to_string()),
            log_level: Some("info".to_string()),
            queue_capacity: Some(1024),
            outbound_buffer: Some(256),
            enqueue_timeout_ms: Some(5_000),
            stats_timeout_ms: Some(2_000),
            bus_retry_delay_ms: Some(3_000),
            log_buffer_frames: Some(512),
            log_chunk_bytes: Some(32 * 1024),
            ..Default::default()
        }
    }

    /// Field-wise merge where `Some` values of `other` win.
    pub fn merge(self, other: GatewayConfig) -> GatewayConfig {
        GatewayConfig {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            redis_url: other.redis_url.or(self.redis_url),
            instance_id: other.instance_id.or(self.instance_id),
            channel_prefix: other.channel_prefix.or(self.channel_prefix),
            stats_prefix: other.stats_prefix.or(self.stats_prefix),
            admin_token: other.admin_token.or(self.admin_token),
            log_dir: other.log_dir.or(self.log_dir),
            log_prefix: other.log_prefix.or(self.log_prefix),
            log_level: other.log_level.or(self.log_level),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            outbound_buffer: other.outbound_buffer.or(self.outbound_buffer),
            enqueue_timeout_ms: other.enqueue_timeout_ms.or(self.enqueue_timeout_ms),
            stats_timeout_ms: other.stats_timeout_ms.or(self.stats_timeout_ms),
            bus_retry_delay_ms: other.bus_retry_delay_ms.or(self.bus_retry_delay_ms),
            log_buffer_frames: other.log_buffer_frames.or(self.log_buffer_frames),
            log_chunk_bytes: other.log_chunk_bytes.or(self.log_chunk_bytes),
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Layers defaults, the config file and `cli` (which already carries the
    /// environment). A missing default file is fine; a missing file named
    /// explicitly is an error.
    pub fn resolve(cli: GatewayConfig) -> Result<GatewayConfig, ConfigError> {
        let mut config = GatewayConfig::defaults();

        let explicit = cli.config_path.clone();
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if explicit.is_some() || path.exists() {
            config = config.merge(GatewayConfig::from_file(&path)?);
        }

        config = config.merge(cli);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queueCapacity", self.queue_capacity),
            ("outboundBuffer", self.outbound_buffer),
            ("logBufferFrames", self.log_buffer_frames),
            ("logChunkBytes", self.log_chunk_bytes),
        ];
        for (field, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.port == Some(0) {
            return Err(ConfigError::Invalid {
                field: "port",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3002)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_prefix(&self) -> &str {
        self.log_prefix.as_deref().unwrap_or("server_gateway")
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn stats_prefix(&self) -> &str {
        self.stats_prefix.as_deref().unwrap_or("gateway:stats")
    }

    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer.unwrap_or(256)
    }

    /// Library-side hub settings.
    pub fn hub_config(&self) -> HubConfig {
        let base = HubConfig::default();
        HubConfig {
            instance_id: self.instance_id.clone().unwrap_or(base.instance_id),
            channel_prefix: self.channel_prefix.clone().unwrap_or(base.channel_prefix),
            queue_capacity: self.queue_capacity.unwrap_or(base.queue_capacity),
            enqueue_timeout: self
                .enqueue_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.enqueue_timeout),
            stats_timeout: self
                .stats_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.stats_timeout),
            bus_retry_delay: self
                .bus_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.bus_retry_delay),
            log_dir: Some(self.log_dir()),
            log_buffer_frames: self.log_buffer_frames.unwrap_or(base.log_buffer_frames),
            log_chunk_bytes: self.log_chunk_bytes.unwrap_or(base.log_chunk_bytes),
            ..base
        }
    }

    /// Admin credential check. Without a configured token nothing passes.
    pub fn token_validator(&self) -> TokenValidator {
        match self.admin_token.clone().filter(|t| !t.is_empty()) {
            Some(expected) => Arc::new(move |token: &str| token == expected),
            None => Arc::new(|_: &str| false),
        }
    }
}

/// Loads `.env`, parses the command line and resolves the layered config.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    let _ = dotenvy::dotenv();
    let cli = GatewayConfig::try_parse()?;
    GatewayConfig::resolve(cli)
}
