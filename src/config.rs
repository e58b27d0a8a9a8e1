//! Runtime configuration.
//!
//! All durations are integer milliseconds. Every field has a default, so a
//! partial JSON document is enough:
//!
//! ```
//! # use ferry::FerryConfig;
//! let config = FerryConfig::from_json_str(r#"{ "lease": { "pool_size": 4 } }"#).unwrap();
//! assert_eq!(config.lease.pool_size, 4);
//! assert_eq!(config.lease.lease_timeout_ms, 30_000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FerryError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FerryConfig {
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Upper bound for durations compared against wall-clock timestamps: one year.
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

impl FerryConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FerryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let lease = &self.lease;
        if lease.pool_size == 0 {
            return Err(FerryError::Config("lease.pool_size must be at least 1".into()));
        }
        if lease.heartbeat_interval_ms == 0 {
            return Err(FerryError::Config(
                "lease.heartbeat_interval_ms must be positive".into(),
            ));
        }
        // A holder must get at least one heartbeat in before it can be considered stale.
        if lease.lease_timeout_ms <= lease.heartbeat_interval_ms {
            return Err(FerryError::Config(format!(
                "lease.lease_timeout_ms ({}) must exceed lease.heartbeat_interval_ms ({})",
                lease.lease_timeout_ms, lease.heartbeat_interval_ms
            )));
        }
        if lease.lease_timeout_ms > MAX_DURATION_MS {
            return Err(FerryError::Config(format!(
                "lease.lease_timeout_ms ({}) must not exceed {MAX_DURATION_MS}",
                lease.lease_timeout_ms
            )));
        }
        if lease.acquire_retry.max_attempts == 0 {
            return Err(FerryError::Config(
                "lease.acquire_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.recovery.scan_interval_ms == 0 {
            return Err(FerryError::Config(
                "recovery.scan_interval_ms must be positive".into(),
            ));
        }
        if self.recovery.grace_period_ms == 0 {
            return Err(FerryError::Config(
                "recovery.grace_period_ms must be positive".into(),
            ));
        }
        if self.recovery.grace_period_ms > MAX_DURATION_MS {
            return Err(FerryError::Config(format!(
                "recovery.grace_period_ms ({}) must not exceed {MAX_DURATION_MS}",
                self.recovery.grace_period_ms
            )));
        }
        let worker = &self.worker;
        for (name, value) in [
            ("worker.ready_topic", &worker.ready_topic),
            ("worker.metadata_topic_a", &worker.metadata_topic_a),
            ("worker.metadata_topic_b", &worker.metadata_topic_b),
            ("worker.consumer_group", &worker.consumer_group),
        ] {
            if value.is_empty() {
                return Err(FerryError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Slot pool and lease timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Number of slots in the pool
    pub pool_size: u32,

    /// How often the holder refreshes its heartbeat (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// A holder whose heartbeat is older than this may be displaced (milliseconds)
    pub lease_timeout_ms: u64,

    /// Backoff between full acquisition passes
    pub acquire_retry: RetryConfig,

    /// Stop lease-gated work when the lease is observed lost
    pub halt_on_lease_loss: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            heartbeat_interval_ms: 10_000,
            lease_timeout_ms: 30_000,
            acquire_retry: RetryConfig::default(),
            halt_on_lease_loss: true,
        }
    }
}

impl LeaseConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_timeout_ms.min(MAX_DURATION_MS) as i64)
    }
}

/// Exponential backoff: `backoff_ms * backoff_factor ^ attempt`, capped at `max_backoff_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Topics, consumer group and redelivery pacing for the batch worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub ready_topic: String,
    pub metadata_topic_a: String,
    pub metadata_topic_b: String,
    pub consumer_group: String,

    /// Pause after a transient failure before taking the next delivery (milliseconds)
    pub redelivery_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ready_topic: "batch.ingestion.events".to_string(),
            metadata_topic_a: "topic-alpha".to_string(),
            metadata_topic_b: "topic-beta".to_string(),
            consumer_group: "ingestion-worker-group".to_string(),
            redelivery_backoff_ms: 1000,
        }
    }
}

/// Recovery scan cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub scan_interval_ms: u64,

    /// READY batches younger than this are left to the normal event path (milliseconds)
    pub grace_period_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 60_000,
            grace_period_ms: 300_000,
        }
    }
}

impl RecoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.grace_period_ms.min(MAX_DURATION_MS) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FerryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lease.pool_size, 10);
        assert_eq!(config.worker.ready_topic, "batch.ingestion.events");
        assert_eq!(config.recovery.grace_period_ms, 300_000);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config = FerryConfig::from_json_str(
            r#"{ "worker": { "metadata_topic_a": "alpha" }, "recovery": { "grace_period_ms": 1000 } }"#,
        )
        .unwrap();
        assert_eq!(config.worker.metadata_topic_a, "alpha");
        assert_eq!(config.worker.metadata_topic_b, "topic-beta");
        assert_eq!(config.recovery.grace_period_ms, 1000);
        assert_eq!(config.recovery.scan_interval_ms, 60_000);
        assert_eq!(config.lease, LeaseConfig::default());
    }

    #[test]
    fn test_rejects_timeout_not_exceeding_heartbeat() {
        let err = FerryConfig::from_json_str(
            r#"{ "lease": { "heartbeat_interval_ms": 30000, "lease_timeout_ms": 30000 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));
    }

    #[test]
    fn test_rejects_durations_beyond_timestamp_range() {
        let err = FerryConfig::from_json_str(
            r#"{ "lease": { "lease_timeout_ms": 18446744073709551615 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));

        let err = FerryConfig::from_json_str(
            r#"{ "recovery": { "grace_period_ms": 9223372036854775808 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));

        let lease = LeaseConfig {
            lease_timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert!(lease.lease_timeout() > chrono::Duration::zero());
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(FerryConfig::from_json_str(r#"{ "lease": { "pool_size": 0 } }"#).is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 5,
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_for(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(350));
    }
}
