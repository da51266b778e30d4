//! Device reading providers.
//!
//! A [`PowerProvider`] enumerates a fixed set of devices when it is built and
//! returns their instantaneous power draw on demand. Vendor backends live in
//! their own crates; this module only defines the seam and a fake used for
//! testing and dry runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ProviderError;
use crate::types::DeviceReading;

/// Trait for power reading backends.
///
/// This allows for different backends (nvidia-smi, RAPL, etc.)
/// and enables testing with fake implementations.
pub trait PowerProvider: Send + Sync {
    /// Number of devices enumerated when the provider was built.
    fn device_count(&self) -> usize;

    /// Reads the current power draw of every enumerated device.
    ///
    /// Readings come back in a stable order from call to call.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying hardware query fails.
    fn read_all(&self) -> Result<Vec<DeviceReading>, ProviderError>;

    /// Returns the name of this provider for logging purposes.
    fn name(&self) -> &'static str;
}

/// A fake power provider for testing.
///
/// Every device reports a constant power draw. Failures and slow reads can be
/// injected to exercise the sampler's error path.
#[derive(Debug, Default)]
pub struct FakePowerProvider {
    devices: Vec<(String, f64)>,
    fail_every: Option<u64>,
    fail_next: AtomicU64,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl FakePowerProvider {
    /// Create a new fake provider with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider with `count` devices named `gpu_{i}_power`, all
    /// drawing `power_usage_mw`.
    #[must_use]
    pub fn uniform(count: usize, power_usage_mw: f64) -> Self {
        (0..count).fold(Self::new(), |provider, i| {
            provider.with_device(format!("gpu_{i}_power"), power_usage_mw)
        })
    }

    /// Add a fake device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>, power_usage_mw: f64) -> Self {
        self.devices.push((device_id.into(), power_usage_mw));
        self
    }

    /// Fail every `n`th call to [`read_all`](PowerProvider::read_all).
    #[must_use]
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Sleep for `delay` inside every read.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `n` reads fail.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of times [`read_all`](PowerProvider::read_all) was called.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, call: u64) -> bool {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        injected || self.fail_every.is_some_and(|n| call % n == 0)
    }
}

impl PowerProvider for FakePowerProvider {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn read_all(&self) -> Result<Vec<DeviceReading>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if self.should_fail(call) {
            return Err(ProviderError::Query(format!("injected failure on call {call}")));
        }

        Ok(self
            .devices
            .iter()
            .map(|(id, power)| DeviceReading::new(id.clone(), *power))
            .collect())
    }

    fn name(&self) -> &'static str {
        "FakePowerProvider"
    }
}
