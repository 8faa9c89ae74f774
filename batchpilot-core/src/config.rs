//! Configuration for the batcher.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::PolicyConfigError;

/// Upper bound for `max_in_flight_batches`: the semaphore's permit limit,
/// and a value `Semaphore::acquire_many` can take in one call
pub const MAX_IN_FLIGHT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Configuration for one batching endpoint
///
/// `max_batch_size` and `max_wait_time` are the hard maxima the adaptive
/// policy may grow to; `min_batch_size` and `min_wait_time` are the floors
/// it may shrink to. Batching starts at the hard maxima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Hard upper bound on requests per batch
    pub max_batch_size: usize,

    /// Floor below which the policy will not shrink the batch size limit
    pub min_batch_size: usize,

    /// Upper bound of the accumulation window
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait_time: Duration,

    /// Lower bound of the accumulation window
    #[serde(rename = "min_wait_ms", with = "duration_ms")]
    pub min_wait_time: Duration,

    /// End-to-end latency (accumulation + dispatch) the policy steers towards
    #[serde(rename = "target_latency_ms", with = "duration_ms")]
    pub target_latency: Duration,

    /// Maximum number of batches queued for dispatch or executing
    pub max_in_flight_batches: usize,

    /// Maximum number of admitted requests not yet picked up by the scheduler
    pub queue_capacity: usize,

    /// Enable latency-driven threshold adjustment
    pub adaptive: bool,

    /// EWMA smoothing factor for observed latency and batch size, in (0, 1]
    pub smoothing: f64,

    /// Fraction of the threshold range moved per unit of relative latency error, in (0, 1]
    pub adjust_gain: f64,

    /// Relative latency error ignored by the policy (dead-band), in [0, 1)
    pub latency_tolerance: f64,

    /// Cut early once no request arrived for this long and `min_batch_size` is met
    #[serde(rename = "idle_flush_ms", with = "option_duration_ms")]
    pub idle_flush: Option<Duration>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            min_batch_size: 1,
            max_wait_time: Duration::from_millis(10),
            min_wait_time: Duration::from_millis(1),
            target_latency: Duration::from_millis(100),
            max_in_flight_batches: 4,
            queue_capacity: 1024,
            adaptive: true,
            smoothing: 0.2,
            adjust_gain: 0.1,
            latency_tolerance: 0.05,
            idle_flush: None,
        }
    }
}

impl BatcherConfig {
    /// Create config optimized for low latency (interactive callers)
    pub fn low_latency() -> Self {
        Self {
            max_batch_size: 8,
            min_batch_size: 1,
            max_wait_time: Duration::from_millis(2),
            min_wait_time: Duration::ZERO,
            target_latency: Duration::from_millis(20),
            max_in_flight_batches: 2,
            queue_capacity: 128,
            ..Self::default()
        }
    }

    /// Create config optimized for high throughput (offline or bulk callers)
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 128,
            min_batch_size: 4,
            max_wait_time: Duration::from_millis(50),
            min_wait_time: Duration::from_millis(5),
            target_latency: Duration::from_millis(500),
            max_in_flight_batches: 8,
            queue_capacity: 8192,
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `BATCHPILOT_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup; unparseable values are ignored
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(n) = parsed(&lookup, "BATCHPILOT_MAX_BATCH_SIZE") {
            self.max_batch_size = n;
        }
        if let Some(n) = parsed(&lookup, "BATCHPILOT_MIN_BATCH_SIZE") {
            self.min_batch_size = n;
        }
        if let Some(ms) = parsed(&lookup, "BATCHPILOT_MAX_WAIT_MS") {
            self.max_wait_time = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(&lookup, "BATCHPILOT_MIN_WAIT_MS") {
            self.min_wait_time = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(&lookup, "BATCHPILOT_TARGET_LATENCY_MS") {
            self.target_latency = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&lookup, "BATCHPILOT_MAX_IN_FLIGHT") {
            self.max_in_flight_batches = n;
        }
        if let Some(n) = parsed(&lookup, "BATCHPILOT_QUEUE_CAPACITY") {
            self.queue_capacity = n;
        }
        if let Some(v) = lookup("BATCHPILOT_ADAPTIVE") {
            self.adaptive = v == "1" || v.eq_ignore_ascii_case("true");
        }

        self
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, PolicyConfigError> {
        serde_json::from_str(json).map_err(|e| PolicyConfigError::Parse(e.to_string()))
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PolicyConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| PolicyConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Check bounds and coefficients
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.min_batch_size == 0 {
            return Err(PolicyConfigError::ZeroBatchSize);
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(PolicyConfigError::BatchSizeBounds {
                min: self.min_batch_size,
                max: self.max_batch_size,
            });
        }
        if self.min_wait_time > self.max_wait_time {
            return Err(PolicyConfigError::WaitTimeBounds {
                min: self.min_wait_time,
                max: self.max_wait_time,
            });
        }
        if self.target_latency.is_zero() {
            return Err(PolicyConfigError::ZeroTargetLatency);
        }
        if self.max_in_flight_batches == 0 {
            return Err(PolicyConfigError::ZeroInFlight);
        }
        if self.queue_capacity == 0 {
            return Err(PolicyConfigError::ZeroQueueCapacity);
        }
        if self.max_in_flight_batches > MAX_IN_FLIGHT {
            return Err(PolicyConfigError::TooLarge {
                name: "max_in_flight_batches",
                max: MAX_IN_FLIGHT,
                value: self.max_in_flight_batches,
            });
        }
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(PolicyConfigError::TooLarge {
                name: "queue_capacity",
                max: Semaphore::MAX_PERMITS,
                value: self.queue_capacity,
            });
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(PolicyConfigError::OutOfRange {
                name: "smoothing",
                range: "(0, 1]",
                value: self.smoothing,
            });
        }
        if !(self.adjust_gain > 0.0 && self.adjust_gain <= 1.0) {
            return Err(PolicyConfigError::OutOfRange {
                name: "adjust_gain",
                range: "(0, 1]",
                value: self.adjust_gain,
            });
        }
        if !(self.latency_tolerance >= 0.0 && self.latency_tolerance < 1.0) {
            return Err(PolicyConfigError::OutOfRange {
                name: "latency_tolerance",
                range: "[0, 1)",
                value: self.latency_tolerance,
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatcherConfig::default();
        assert_eq!(config.max_batch_size, 32);
        assert_eq!(config.min_batch_size, 1);
        assert!(config.adaptive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let low = BatcherConfig::low_latency();
        assert_eq!(low.max_batch_size, 8);
        assert!(low.validate().is_ok());

        let high = BatcherConfig::high_throughput();
        assert_eq!(high.max_batch_size, 128);
        assert_eq!(high.min_batch_size, 4);
        assert!(high.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = BatcherConfig { min_batch_size: 16, max_batch_size: 8, ..Default::default() };
        assert_eq!(
            config.validate(),
            Err(PolicyConfigError::BatchSizeBounds { min: 16, max: 8 })
        );

        let config = BatcherConfig {
            min_wait_time: Duration::from_millis(20),
            max_wait_time: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PolicyConfigError::WaitTimeBounds { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = BatcherConfig { min_batch_size: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(PolicyConfigError::ZeroBatchSize));

        let config = BatcherConfig { max_in_flight_batches: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(PolicyConfigError::ZeroInFlight));

        let config = BatcherConfig { queue_capacity: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(PolicyConfigError::ZeroQueueCapacity));

        let config = BatcherConfig { target_latency: Duration::ZERO, ..Default::default() };
        assert_eq!(config.validate(), Err(PolicyConfigError::ZeroTargetLatency));
    }

    #[test]
    fn test_validate_rejects_oversized_limits() {
        let config = BatcherConfig { max_in_flight_batches: usize::MAX, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(PolicyConfigError::TooLarge { name: "max_in_flight_batches", .. })
        ));

        let config = BatcherConfig { queue_capacity: usize::MAX, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(PolicyConfigError::TooLarge { name: "queue_capacity", .. })
        ));

        let config = BatcherConfig { max_in_flight_batches: MAX_IN_FLIGHT, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_coefficients() {
        let config = BatcherConfig { smoothing: 0.0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(PolicyConfigError::OutOfRange { name: "smoothing", .. })
        ));

        let config = BatcherConfig { adjust_gain: f64::NAN, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(PolicyConfigError::OutOfRange { name: "adjust_gain", .. })
        ));

        let config = BatcherConfig { latency_tolerance: 1.0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(PolicyConfigError::OutOfRange { name: "latency_tolerance", .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BATCHPILOT_MAX_BATCH_SIZE", "64"),
            ("BATCHPILOT_MAX_WAIT_MS", "25"),
            ("BATCHPILOT_QUEUE_CAPACITY", "not-a-number"),
            ("BATCHPILOT_ADAPTIVE", "false"),
        ]
        .into_iter()
        .collect();

        let config = BatcherConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_batch_size, 64);
        assert_eq!(config.max_wait_time, Duration::from_millis(25));
        assert_eq!(config.queue_capacity, 1024);
        assert!(!config.adaptive);
    }

    #[test]
    fn test_json_partial_config() {
        let config = BatcherConfig::from_json_str(
            r#"{"max_batch_size": 4, "max_wait_ms": 50, "idle_flush_ms": 5}"#,
        )
        .unwrap();

        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.max_wait_time, Duration::from_millis(50));
        assert_eq!(config.idle_flush, Some(Duration::from_millis(5)));
        assert_eq!(config.queue_capacity, BatcherConfig::default().queue_capacity);
    }

    #[test]
    fn test_json_parse_error() {
        let err = BatcherConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, PolicyConfigError::Parse(_)));
    }

    #[test]
    fn test_json_serialization_uses_milliseconds() {
        let json = serde_json::to_value(BatcherConfig::default()).unwrap();
        assert_eq!(json["max_wait_ms"], 10);
        assert_eq!(json["target_latency_ms"], 100);
        assert!(json["idle_flush_ms"].is_null());
    }
}
