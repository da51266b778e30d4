//! Thread-safe append-only store of power samples.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::types::{DeviceReading, MetricSeries};

/// Append-only per-device sample store.
///
/// Writes come from the sampling thread; snapshots can be taken from any
/// thread at any time. Cloning shares the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    data: Arc<RwLock<HashMap<String, Vec<f64>>>>,
}

impl MetricAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one batch of readings.
    ///
    /// The whole batch is applied under a single write lock, so a concurrent
    /// snapshot sees either none or all of it. Unknown devices get a new
    /// series.
    pub fn record(&self, readings: &[DeviceReading]) {
        if readings.is_empty() {
            return;
        }

        let mut data = self.data.write();
        for reading in readings {
            if let Some(samples) = data.get_mut(&reading.device_id) {
                samples.push(reading.power_usage_mw);
            } else {
                debug!(device = %reading.device_id, "tracking new device");
                data.insert(reading.device_id.clone(), vec![reading.power_usage_mw]);
            }
        }
        drop(data);

        trace!(readings = readings.len(), "recorded readings");
    }

    /// Returns an isolated copy of every series.
    #[must_use]
    pub fn snapshot(&self) -> MetricSeries {
        let data = self.data.read();
        data.iter()
            .map(|(id, samples)| (id.clone(), samples.clone()))
            .collect()
    }

    /// Number of samples recorded for `device_id`.
    #[must_use]
    pub fn sample_count(&self, device_id: &str) -> usize {
        self.data.read().get(device_id).map_or(0, Vec::len)
    }

    /// Number of devices seen so far.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.data.read().len()
    }

    /// Number of samples across all devices.
    #[must_use]
    pub fn total_samples(&self) -> usize {
        self.data.read().values().map(Vec::len).sum()
    }

    /// Drops every recorded sample.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}
