//! Messaging configuration types.

use serde::Deserialize;

/// AMQP connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum pooled broker connections.
    pub connection_pool_size: usize,
    /// Maximum idle publish channels kept for reuse.
    pub channel_pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connection_pool_size: 4,
            channel_pool_size: 16,
        }
    }
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Retry settings for publish and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Backoff unit: retry `n` waits `base_delay_ms * 2^n`.
    pub base_delay_ms: u64,
    /// Cap on a single wait.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Prefix of consumer tags (`{prefix}-{queue}`).
    pub consumer_tag_prefix: String,
    /// How long shutdown waits for consumers to finish their current message.
    pub shutdown_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_tag_prefix: "rabbitbus".to_string(),
            shutdown_timeout_ms: 30_000,
        }
    }
}
