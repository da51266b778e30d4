//! Periodic device sampling.
//!
//! [`DeviceSampler`] is the tick body: one round of provider reads fed into a
//! [`MetricAccumulator`]. [`DeviceLogger`] wires a sampler to a
//! [`RepeatingTask`] and is what callers start and stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::accumulator::MetricAccumulator;
use crate::config::SamplerConfig;
use crate::error::{ProviderError, Result};
use crate::provider::PowerProvider;
use crate::scheduler::{RepeatingTask, TaskHandle, TickHandler};
use crate::types::{MetricSeries, SessionWindow};

/// A tick whose provider read failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFailure {
    /// 1-based index of the failed tick.
    pub tick: u64,
    /// When the failure happened.
    pub at: DateTime<Utc>,
    /// What the provider reported.
    pub error: ProviderError,
}

/// Tick counters for one sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    /// Ticks whose readings were recorded.
    pub ticks_ok: u64,
    /// Ticks skipped because the provider failed.
    pub ticks_failed: u64,
}

impl SamplerStats {
    /// Total ticks attempted.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks_ok + self.ticks_failed
    }
}

/// Reads every device once per tick and records the readings.
///
/// Provider errors never escape a tick: the sample is skipped, counted, and
/// reported on the failure channel if one is attached.
pub struct DeviceSampler {
    provider: Arc<dyn PowerProvider>,
    accumulator: MetricAccumulator,
    ticks_ok: AtomicU64,
    ticks_failed: AtomicU64,
    last_error: Mutex<Option<ProviderError>>,
    failures: Mutex<Option<mpsc::Sender<SampleFailure>>>,
}

impl std::fmt::Debug for DeviceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSampler")
            .field("provider", &self.provider.name())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DeviceSampler {
    /// Creates a sampler feeding `accumulator`.
    #[must_use]
    pub fn new(provider: Arc<dyn PowerProvider>, accumulator: MetricAccumulator) -> Self {
        Self {
            provider,
            accumulator,
            ticks_ok: AtomicU64::new(0),
            ticks_failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
            failures: Mutex::new(None),
        }
    }

    /// Runs one round of reads.
    ///
    /// Returns the number of readings recorded.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the read failed; nothing is recorded.
    pub fn sample_once(&self) -> std::result::Result<usize, ProviderError> {
        match self.provider.read_all() {
            Ok(readings) => {
                self.accumulator.record(&readings);
                let tick = self.ticks_ok.fetch_add(1, Ordering::SeqCst) + 1;
                trace!(
                    provider = self.provider.name(),
                    tick,
                    readings = readings.len(),
                    "sampled devices"
                );
                Ok(readings.len())
            }
            Err(e) => {
                let failed = self.ticks_failed.fetch_add(1, Ordering::SeqCst) + 1;
                let tick = failed + self.ticks_ok.load(Ordering::SeqCst);
                warn!(
                    provider = self.provider.name(),
                    tick,
                    error = %e,
                    "device read failed; skipping sample"
                );
                *self.last_error.lock() = Some(e.clone());
                self.report(SampleFailure {
                    tick,
                    at: Utc::now(),
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    fn report(&self, failure: SampleFailure) {
        let mut failures = self.failures.lock();
        let disconnected = failures
            .as_ref()
            .is_some_and(|tx| tx.send(failure).is_err());
        if disconnected {
            debug!("failure receiver dropped; detaching channel");
            *failures = None;
        }
    }

    /// Attaches a new failure channel, replacing any previous one.
    #[must_use]
    pub fn subscribe_failures(&self) -> mpsc::Receiver<SampleFailure> {
        let (tx, rx) = mpsc::channel();
        *self.failures.lock() = Some(tx);
        rx
    }

    /// Tick counters so far.
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            ticks_ok: self.ticks_ok.load(Ordering::SeqCst),
            ticks_failed: self.ticks_failed.load(Ordering::SeqCst),
        }
    }

    /// The most recent provider error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ProviderError> {
        self.last_error.lock().clone()
    }

    /// The accumulator this sampler records into.
    #[must_use]
    pub const fn accumulator(&self) -> &MetricAccumulator {
        &self.accumulator
    }
}

impl TickHandler for DeviceSampler {
    fn on_tick(&self) {
        // Failures are already counted and logged.
        let _ = self.sample_once();
    }
}

/// Samples a provider in the background at a fixed interval.
///
/// Cloning yields a stopped logger with the same configuration and provider
/// and an empty series; running state and samples are never shared.
pub struct DeviceLogger {
    config: SamplerConfig,
    provider: Arc<dyn PowerProvider>,
    sampler: Arc<DeviceSampler>,
    task: RepeatingTask,
}

impl std::fmt::Debug for DeviceLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLogger")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .field("sampler", &self.sampler)
            .field("task", &self.task)
            .finish()
    }
}

impl DeviceLogger {
    /// Creates a stopped logger.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::InvalidConfig` if the config is invalid.
    pub fn new(provider: Arc<dyn PowerProvider>, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(provider, config))
    }

    /// Creates a stopped logger with default settings and the given interval.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::InvalidConfig` if the interval is zero.
    pub fn with_interval(provider: Arc<dyn PowerProvider>, interval: Duration) -> Result<Self> {
        Self::new(provider, SamplerConfig::with_interval(interval))
    }

    fn build(provider: Arc<dyn PowerProvider>, config: SamplerConfig) -> Self {
        let sampler = Arc::new(DeviceSampler::new(
            Arc::clone(&provider),
            MetricAccumulator::new(),
        ));
        let task = RepeatingTask::build(config.interval(), Arc::clone(&sampler))
            .named(config.thread_name.clone());

        debug!(
            provider = provider.name(),
            devices = provider.device_count(),
            interval = ?config.interval(),
            "device logger created"
        );

        Self {
            config,
            provider,
            sampler,
            task,
        }
    }

    /// Starts sampling. A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if the sampling thread cannot be created.
    pub fn start(&self) -> Result<()> {
        self.task.start()
    }

    /// Starts sampling into an emptied series. A no-op if already running,
    /// in which case nothing is cleared.
    ///
    /// The series is cleared before the first tick can record anything.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if the sampling thread cannot be created;
    /// the series is then left untouched.
    pub fn start_fresh(&self) -> Result<()> {
        let accumulator = self.sampler.accumulator();
        self.task.start_with(|| accumulator.clear())
    }

    /// Stops sampling. A no-op if not running.
    ///
    /// No sample is recorded after this returns.
    pub fn stop(&self) {
        self.task.stop();
    }

    /// Returns true while sampling.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Snapshot of every device's samples so far.
    #[must_use]
    pub fn metrics(&self) -> MetricSeries {
        self.sampler.accumulator().snapshot()
    }

    /// The accumulator samples are recorded into.
    #[must_use]
    pub fn accumulator(&self) -> &MetricAccumulator {
        self.sampler.accumulator()
    }

    /// The sampling interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.config.interval()
    }

    /// The configuration this logger was built with.
    #[must_use]
    pub const fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// The provider being sampled.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn PowerProvider> {
        &self.provider
    }

    /// Tick counters so far.
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        self.sampler.stats()
    }

    /// The most recent provider error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ProviderError> {
        self.sampler.last_error()
    }

    /// Attaches a channel receiving every failed tick.
    #[must_use]
    pub fn subscribe_failures(&self) -> mpsc::Receiver<SampleFailure> {
        self.sampler.subscribe_failures()
    }

    /// Start and end of the most recent session, if any.
    #[must_use]
    pub fn window(&self) -> Option<SessionWindow> {
        self.task.window()
    }

    /// A handle that can stop sampling from any thread.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        self.task.handle()
    }
}

impl Clone for DeviceLogger {
    fn clone(&self) -> Self {
        Self::build(Arc::clone(&self.provider), self.config.clone())
    }
}
