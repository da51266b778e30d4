//! Sampler configuration.
//!
//! Configuration is plain JSON; every field has a default so an empty object
//! is a valid config:
//!
//! ```json
//! { "interval_ms": 500, "policy": "summed", "thread_name": "wattlog-sampler" }
//! ```
//!
//! `interval_ms` may be fractional (`1.5` is 1500 µs).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::PolicyKind;
use crate::error::{EnergyError, Result};
use crate::scheduler::DEFAULT_THREAD_NAME;

/// Default sampling interval in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 500;

/// Configuration for a device sampler and its session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Sampling interval, kept at full precision.
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Conversion policy used to derive session metrics.
    pub policy: PolicyKind,
    /// Name of the background sampling thread.
    pub thread_name: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            policy: PolicyKind::default(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl SamplerConfig {
    /// Creates a default config with the given interval.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Sets the conversion policy.
    #[must_use]
    pub fn policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// The sampling interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Io` if the file cannot be read, or an error if it
    /// cannot be parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EnergyError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read config file '{}': {e}", path.as_ref().display()),
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(EnergyError::InvalidConfig(
                "interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.thread_name.is_empty() {
            return Err(EnergyError::InvalidConfig(
                "thread_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// `interval_ms` as whole or fractional milliseconds.
mod millis {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const NANOS_PER_MILLI: u32 = 1_000_000;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if interval.subsec_nanos() % NANOS_PER_MILLI == 0 {
            serializer.serialize_u64(interval.as_millis() as u64)
        } else {
            serializer.serialize_f64(interval.as_nanos() as f64 / f64::from(NANOS_PER_MILLI))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Millis::deserialize(deserializer)? {
            Millis::Whole(ms) => Ok(Duration::from_millis(ms)),
            Millis::Fractional(ms) if ms.is_finite() && ms >= 0.0 => {
                let nanos = (ms * f64::from(NANOS_PER_MILLI)).round();
                if nanos > u64::MAX as f64 {
                    return Err(D::Error::custom(format!("interval_ms {ms} is too large")));
                }
                Ok(Duration::from_nanos(nanos as u64))
            }
            Millis::Fractional(ms) => Err(D::Error::custom(format!(
                "interval_ms must be a non-negative number, got {ms}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.interval(), Duration::from_millis(500));
        assert_eq!(config.policy, PolicyKind::Summed);
        assert_eq!(config.thread_name, "wattlog-sampler");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = SamplerConfig::from_json("{}").expect("should parse");
        assert_eq!(config, SamplerConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{"interval_ms": 100, "policy": "integrated", "thread_name": "gpu-sampler"}"#;
        let config = SamplerConfig::from_json(json).expect("should parse");

        assert_eq!(config.interval(), Duration::from_millis(100));
        assert_eq!(config.policy, PolicyKind::Integrated);
        assert_eq!(config.thread_name, "gpu-sampler");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = SamplerConfig::from_json(r#"{"interval_ms": 0}"#).expect_err("should reject");
        assert!(err.to_string().contains("interval_ms must be greater than 0"));
    }

    #[test]
    fn test_empty_thread_name_rejected() {
        let err = SamplerConfig::from_json(r#"{"thread_name": ""}"#).expect_err("should reject");
        assert!(err.to_string().contains("thread_name cannot be empty"));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let err = SamplerConfig::from_json(r#"{"policy": "median"}"#).expect_err("should reject");
        assert!(matches!(err, EnergyError::Json(_)));
    }

    #[test]
    fn test_load_from_file() {
        let file = create_temp_config(r#"{"interval_ms": 250}"#);
        let config = SamplerConfig::from_file(file.path()).expect("should load from file");
        assert_eq!(config.interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_file_not_found() {
        let err = SamplerConfig::from_file("/nonexistent/wattlog.json").expect_err("should fail");
        match err {
            EnergyError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert!(e.to_string().contains("/nonexistent/wattlog.json"));
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_builder_helpers() {
        let config = SamplerConfig::with_interval(Duration::from_millis(50)).policy(PolicyKind::Integrated);
        assert_eq!(config.interval(), Duration::from_millis(50));
        assert_eq!(config.policy, PolicyKind::Integrated);
    }

    #[test]
    fn test_sub_millisecond_interval_is_kept() {
        let interval = Duration::from_micros(1900);
        let config = SamplerConfig::with_interval(interval);
        assert_eq!(config.interval(), interval);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fractional_interval_from_json() {
        let config = SamplerConfig::from_json(r#"{"interval_ms": 1.9}"#).expect("should parse");
        assert_eq!(config.interval(), Duration::from_micros(1900));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let err = SamplerConfig::from_json(r#"{"interval_ms": -5}"#).expect_err("should reject");
        assert!(matches!(err, EnergyError::Json(_)));
    }

    #[test]
    fn test_interval_serializes_as_millis() {
        let whole = serde_json::to_value(SamplerConfig::default()).expect("serialize");
        assert_eq!(whole["interval_ms"], 500);

        let fractional = serde_json::to_string(&SamplerConfig::with_interval(Duration::from_micros(1500)))
            .expect("serialize");
        let back = SamplerConfig::from_json(&fractional).expect("round trip");
        assert_eq!(back.interval(), Duration::from_micros(1500));
    }
}
