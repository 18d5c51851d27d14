//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the [`Engine`](crate::engine::Engine).
///
/// Every field has a default, so a partial JSON document deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an acknowledged fire waits for every subscriber.
    pub ack_timeout_ms: u64,
    /// Per-subscriber delivery buffer. A full buffer slows the firer down.
    pub subscriber_buffer: usize,
    /// Attempts per delivery before it is reported as a fault.
    pub delivery_attempts: u32,
    /// Pause between delivery attempts.
    pub delivery_retry_backoff_ms: u64,
    /// Queue bound for triggers that do not set `queue_capacity`.
    pub default_queue_capacity: usize,
    /// Re-runs of a transition after a state version conflict.
    pub conflict_retries: u32,
    /// Buffer per stream subscriber in the in-memory stream provider.
    pub stream_buffer: usize,
    /// How long shutdown waits for in-flight target invocations.
    pub drain_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            subscriber_buffer: 256,
            delivery_attempts: 3,
            delivery_retry_backoff_ms: 50,
            default_queue_capacity: 1_024,
            conflict_retries: 1,
            stream_buffer: 1_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn delivery_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery_retry_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"delivery_attempts": 5}"#).expect("parses");
        assert_eq!(config.delivery_attempts, 5);
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.conflict_retries, 1);
    }
}
