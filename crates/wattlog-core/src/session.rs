//! Energy sessions and metrics sinks.
//!
//! An [`EnergySession`] brackets a piece of work with `start`/`stop`, then
//! converts what was sampled into [`DerivedMetrics`] and hands them to a
//! [`MetricsSink`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::SamplerConfig;
use crate::convert::ConversionPolicy;
use crate::error::{EnergyError, Result};
use crate::provider::PowerProvider;
use crate::sampler::DeviceLogger;
use crate::types::{DerivedMetrics, MetricSeries, SessionWindow};

/// Receives the derived metrics of a finished session.
pub trait MetricsSink: Send + Sync {
    /// Publishes one session's metrics.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Sink` if the metrics could not be delivered.
    fn publish(&self, metrics: &DerivedMetrics) -> Result<()>;
}

/// Logs every metric at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn publish(&self, metrics: &DerivedMetrics) -> Result<()> {
        for (name, value) in metrics.iter() {
            info!(metric = name, value, "session metric");
        }
        Ok(())
    }
}

/// Keeps every published mapping in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<DerivedMetrics>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<DerivedMetrics> {
        self.published.lock().clone()
    }

    /// The most recent mapping.
    #[must_use]
    pub fn last(&self) -> Option<DerivedMetrics> {
        self.published.lock().last().cloned()
    }
}

impl MetricsSink for MemorySink {
    fn publish(&self, metrics: &DerivedMetrics) -> Result<()> {
        self.published.lock().push(metrics.clone());
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn publish(&self, metrics: &DerivedMetrics) -> Result<()> {
        (**self).publish(metrics)
    }
}

/// Samples devices for the span of some work and derives its energy cost.
///
/// Starting a session again after it stopped begins a new session with an
/// empty series.
#[derive(Debug)]
pub struct EnergySession {
    logger: DeviceLogger,
    policy: Box<dyn ConversionPolicy>,
}

impl EnergySession {
    /// Creates a stopped session using the policy named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::InvalidConfig` if the config is invalid.
    pub fn new(provider: Arc<dyn PowerProvider>, config: SamplerConfig) -> Result<Self> {
        let policy = config.policy.build(config.interval());
        let logger = DeviceLogger::new(provider, config)?;
        Ok(Self { logger, policy })
    }

    /// Replaces the conversion policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Box<dyn ConversionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Starts a new session with an empty series. A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if the sampling thread cannot be created.
    pub fn start(&self) -> Result<()> {
        self.logger.start_fresh()
    }

    /// Stops sampling and fixes the session duration. A no-op if not running.
    pub fn stop(&self) {
        self.logger.stop();
    }

    /// Returns true while sampling.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.logger.is_running()
    }

    /// Session duration, once stopped.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.logger.window().and_then(|w| w.duration())
    }

    /// Start and end of the current or last session.
    #[must_use]
    pub fn window(&self) -> Option<SessionWindow> {
        self.logger.window()
    }

    /// Raw samples recorded so far; readable while running.
    #[must_use]
    pub fn samples(&self) -> MetricSeries {
        self.logger.metrics()
    }

    /// The underlying logger.
    #[must_use]
    pub const fn logger(&self) -> &DeviceLogger {
        &self.logger
    }

    /// The active conversion policy.
    #[must_use]
    pub fn policy(&self) -> &dyn ConversionPolicy {
        self.policy.as_ref()
    }

    /// Derived energy and emissions for the stopped session.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::SessionNotStarted` before the first `start`, and
    /// `EnergyError::SessionNotStopped` while sampling is running.
    pub fn metrics(&self) -> Result<DerivedMetrics> {
        let window = self.logger.window().ok_or(EnergyError::SessionNotStarted)?;
        let duration = window.duration().ok_or(EnergyError::SessionNotStopped)?;
        Ok(self.policy.convert(&self.logger.metrics(), duration))
    }

    /// Stops the session and publishes its metrics to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was never started or the sink fails.
    pub fn finish(&self, sink: &dyn MetricsSink) -> Result<DerivedMetrics> {
        self.stop();
        let metrics = self.metrics()?;

        info!(
            policy = self.policy.name(),
            duration_ms = self.duration().map(|d| d.as_millis()),
            samples = self.logger.accumulator().total_samples(),
            total_kilowatt_hours = metrics.total_kilowatt_hours(),
            "energy session finished"
        );

        sink.publish(&metrics)?;
        Ok(metrics)
    }

    /// Runs `work` inside a session.
    ///
    /// Sampling stops when `work` returns or unwinds.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if sampling cannot start.
    pub fn run<T>(&self, work: impl FnOnce() -> T) -> Result<T> {
        self.start()?;
        let _guard = StopGuard(&self.logger);
        Ok(work())
    }
}

struct StopGuard<'a>(&'a DeviceLogger);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("stopping energy session during unwind");
        }
        self.0.stop();
    }
}
