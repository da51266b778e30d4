//! Error types for the wattlog-core crate.

use thiserror::Error;

/// Errors raised by a [`PowerProvider`](crate::provider::PowerProvider).
///
/// These never escape a sampling tick; the sampler records them and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The underlying hardware or tool is not available.
    #[error("device provider unavailable: {0}")]
    Unavailable(String),

    /// A hardware query failed.
    #[error("device query failed: {0}")]
    Query(String),

    /// The hardware answered with something that could not be parsed.
    #[error("invalid device reading: {0}")]
    Parse(String),
}

/// Errors that can occur while sampling or converting a session.
#[derive(Debug, Error)]
pub enum EnergyError {
    /// Metrics were requested from a session that was never started.
    #[error("session has not been started")]
    SessionNotStarted,

    /// Metrics were requested before the session was stopped.
    #[error("session is still running; stop it before reading derived metrics")]
    SessionNotStopped,

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The background sampling thread could not be spawned.
    #[error("failed to spawn sampling thread: {0}")]
    Spawn(std::io::Error),

    /// A metrics sink rejected the derived metrics.
    #[error("metrics sink failed: {0}")]
    Sink(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for wattlog operations.
pub type Result<T> = std::result::Result<T, EnergyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Query("nvidia-smi exited with 9".to_string());
        assert_eq!(err.to_string(), "device query failed: nvidia-smi exited with 9");
    }

    #[test]
    fn test_session_not_stopped_display() {
        let err = EnergyError::SessionNotStopped;
        assert!(err.to_string().contains("stop it before reading"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = EnergyError::InvalidConfig("interval_ms must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: interval_ms must be greater than 0"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EnergyError = io.into();
        assert!(matches!(err, EnergyError::Io(_)));
    }
}
