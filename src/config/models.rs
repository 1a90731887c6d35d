use crate::humanize::ByteSize;
use crate::messaging::{DEFAULT_DELIVERY_CONCURRENCY, DeliveryConfig};
use crate::protocol::ProtocolSettings;
use crate::protocol::http::HttpConfig;
use crate::task::{Throttle, clamp_max_retries};
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub protocols: ProtocolsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Status endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Task queue and status delivery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    /// Clamped into 0..=10 when used
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Status updates buffered between tools and delivery
    #[serde(default = "default_status_capacity")]
    pub status_capacity: usize,
    #[serde(default)]
    pub throttle: Throttle,
    /// Callbacks delivered at once
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            status_capacity: default_status_capacity(),
            throttle: Throttle::default(),
            delivery_concurrency: default_delivery_concurrency(),
        }
    }
}

impl QueueConfig {
    pub fn effective_max_retries(&self) -> u32 {
        clamp_max_retries(self.max_retries)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            throttle: self.throttle,
            concurrency: self.delivery_concurrency,
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_max_retries() -> i64 {
    3
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_status_capacity() -> usize {
    1024
}

fn default_delivery_concurrency() -> usize {
    DEFAULT_DELIVERY_CONCURRENCY
}

/// Job store
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/jobs")
}

/// Protocol handler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolsConfig {
    /// Largest payload a buffering handler (S3, Glacier) accepts
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: ByteSize,
    #[serde(default = "default_http_connect_timeout_secs")]
    pub http_connect_timeout_secs: u64,
    #[serde(default = "default_http_user_agent")]
    pub http_user_agent: String,
    #[serde(default = "default_http_max_retries")]
    pub http_max_retries: u32,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            http_connect_timeout_secs: default_http_connect_timeout_secs(),
            http_user_agent: default_http_user_agent(),
            http_max_retries: default_http_max_retries(),
        }
    }
}

impl ProtocolsConfig {
    pub fn settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            max_buffer_bytes: self.max_buffer_bytes,
            http: HttpConfig {
                connect_timeout: Duration::from_secs(self.http_connect_timeout_secs),
                max_retries: self.http_max_retries,
                user_agent: self.http_user_agent.clone(),
            },
        }
    }
}

fn default_max_buffer_bytes() -> ByteSize {
    ByteSize(64 * 1024 * 1024) // 64 MB
}

fn default_http_connect_timeout_secs() -> u64 {
    10
}

fn default_http_user_agent() -> String {
    concat!("mediaferry/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_http_max_retries() -> u32 {
    3
}

/// Tool capacity overrides keyed by task type tag
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub capacity: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.queue.max_retries, 3);
        assert!(!config.queue.throttle.is_enabled());
        assert_eq!(config.protocols.max_buffer_bytes.as_u64(), 64 * 1024 * 1024);
        assert!(config.tools.capacity.is_empty());
    }

    #[test]
    fn test_max_retries_is_clamped() {
        let mut queue = QueueConfig::default();
        queue.max_retries = 100;
        assert_eq!(queue.effective_max_retries(), 10);
        queue.max_retries = -1;
        assert_eq!(queue.effective_max_retries(), 0);
    }

    #[test]
    fn test_protocol_settings() {
        let protocols = ProtocolsConfig {
            http_connect_timeout_secs: 3,
            ..ProtocolsConfig::default()
        };
        let settings = protocols.settings();
        assert_eq!(settings.http.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.max_buffer_bytes, protocols.max_buffer_bytes);
    }
}
