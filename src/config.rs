//! Topic service configuration.
//!
//! Holds channel-count defaults, request timeouts and the graveyard bounds.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Used when `request_timeout_ms` is zero.
pub const FALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Name substituted for an empty topic name.
pub const DEFAULT_TOPIC_NAME: &str = "Default";

/// Configuration for one topic service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name of the hosting service, used in log lines.
    pub service_name: String,

    /// Channel count for topics without an override.
    /// Default: 17
    pub default_channel_count: u32,

    /// Per-topic overrides keyed by topic name.
    pub topics: BTreeMap<String, TopicConfig>,

    /// Timeout for blocking client calls.
    /// Default: 0 (five minutes)
    pub request_timeout_ms: u64,

    /// Sleep between confirmation and channel-count polling rounds.
    /// Default: 10 ms
    pub confirm_retry_interval_ms: u64,

    /// Interval between progress lines while a caller is waiting.
    /// Default: 30 s
    pub progress_log_interval_ms: u64,

    /// How long a destroyed subscription id is remembered.
    /// Default: 5 minutes
    pub graveyard_ttl_ms: u64,

    /// Maximum remembered destroyed ids.
    /// Default: 10_000
    pub graveyard_capacity: usize,

    /// Size of the subscription id range a senior reserves at a time.
    /// Default: 1000
    pub subscription_id_block: u64,

    /// Destroy named groups left without subscribers by departure cleanup.
    /// Default: false
    pub destroy_empty_durable_groups: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "TopicService".to_string(),
            default_channel_count: 17,
            topics: BTreeMap::new(),
            request_timeout_ms: 0,
            confirm_retry_interval_ms: 10,
            progress_log_interval_ms: 30_000,
            graveyard_ttl_ms: 5 * 60 * 1000,
            graveyard_capacity: 10_000,
            subscription_id_block: 1000,
            destroy_empty_durable_groups: false,
        }
    }
}

/// Per-topic overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub channel_count: Option<u32>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: ServiceConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_channel_count == 0 {
            return Err(Error::Config("default_channel_count must be >= 1".into()));
        }
        for (name, topic) in &self.topics {
            if topic.channel_count == Some(0) {
                return Err(Error::Config(format!("topic {name}: channel_count must be >= 1")));
            }
        }
        if self.confirm_retry_interval_ms == 0 {
            return Err(Error::Config("confirm_retry_interval_ms must be > 0".into()));
        }
        if self.subscription_id_block == 0 {
            return Err(Error::Config("subscription_id_block must be > 0".into()));
        }
        Ok(())
    }

    /// Configured channel count for `topic`.
    pub fn channel_count(&self, topic: &str) -> u32 {
        self.topics
            .get(topic)
            .and_then(|t| t.channel_count)
            .unwrap_or(self.default_channel_count)
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_ms == 0 {
            FALLBACK_REQUEST_TIMEOUT
        } else {
            Duration::from_millis(self.request_timeout_ms)
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_retry_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_log_interval_ms)
    }
}
