//! Core types for power sampling.
//!
//! - [`DeviceReading`]: one instantaneous power measurement for one device
//! - [`MetricSeries`]: the ordered sample history of every device in a session
//! - [`Pollutant`]: the emission kinds derived from energy use
//! - [`DerivedMetrics`]: the energy/emissions mapping produced after a session
//! - [`SessionWindow`]: start and end of one sampling session

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric name under which total energy is reported.
pub const TOTAL_KILOWATT_HOURS: &str = "total_kilowatt_hours";

/// A single power reading for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Stable device identifier (e.g. `gpu_0_power`).
    pub device_id: String,
    /// Instantaneous power draw in milliwatts.
    pub power_usage_mw: f64,
}

impl DeviceReading {
    /// Creates a new reading.
    #[must_use]
    pub fn new(device_id: impl Into<String>, power_usage_mw: f64) -> Self {
        Self {
            device_id: device_id.into(),
            power_usage_mw,
        }
    }
}

/// Per-device power samples in milliwatts, in sampling order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSeries(BTreeMap<String, Vec<f64>>);

impl MetricSeries {
    /// Creates an empty series.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample to a device's history, creating it if needed.
    pub fn push(&mut self, device_id: impl Into<String>, power_usage_mw: f64) {
        self.0.entry(device_id.into()).or_default().push(power_usage_mw);
    }

    /// Returns the samples recorded for `device_id`.
    #[must_use]
    pub fn samples_for(&self, device_id: &str) -> Option<&[f64]> {
        self.0.get(device_id).map(Vec::as_slice)
    }

    /// Returns the known device ids in sorted order.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of devices with a history.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.0.len()
    }

    /// Number of samples across all devices.
    #[must_use]
    pub fn total_samples(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Plain sum of every sample of every device, in milliwatts.
    #[must_use]
    pub fn total_milliwatts(&self) -> f64 {
        self.0.values().flat_map(|samples| samples.iter()).sum()
    }

    /// Returns true if no samples were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_samples() == 0
    }

    /// Iterates over `(device_id, samples)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.0.iter().map(|(id, samples)| (id.as_str(), samples.as_slice()))
    }
}

impl FromIterator<(String, Vec<f64>)> for MetricSeries {
    fn from_iter<I: IntoIterator<Item = (String, Vec<f64>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Emission kinds reported alongside energy use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pollutant {
    /// Carbon dioxide equivalent.
    Co2e,
    /// Carbon dioxide.
    Co2,
    /// Methane.
    Ch4,
    /// Nitrous oxide.
    N2o,
}

impl Pollutant {
    /// Every pollutant, in reporting order.
    pub const ALL: [Self; 4] = [Self::Co2e, Self::Co2, Self::Ch4, Self::N2o];

    /// Metric name for this pollutant.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Co2e => "co2e",
            Self::Co2 => "co2",
            Self::Ch4 => "ch4",
            Self::N2o => "n2o",
        }
    }

    /// Emission factor in kilograms per kilowatt-hour.
    #[must_use]
    pub const fn factor(self) -> f64 {
        match self {
            Self::Co2e => 0.28307,
            Self::Co2 => 0.28088,
            Self::Ch4 => 0.00066,
            Self::N2o => 0.00153,
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Energy and emissions metrics derived from one session.
///
/// Serializes as a flat `{name: value}` object so it can be handed directly
/// to an experiment tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivedMetrics(BTreeMap<String, f64>);

impl DerivedMetrics {
    /// Builds the mapping from a kilowatt-hour figure.
    #[must_use]
    pub fn from_kilowatt_hours(kilowatt_hours: f64) -> Self {
        let mut metrics = BTreeMap::new();
        for pollutant in Pollutant::ALL {
            metrics.insert(pollutant.name().to_string(), pollutant.factor() * kilowatt_hours);
        }
        metrics.insert(TOTAL_KILOWATT_HOURS.to_string(), kilowatt_hours);
        Self(metrics)
    }

    /// Looks up a metric by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Total energy in kilowatt-hours.
    #[must_use]
    pub fn total_kilowatt_hours(&self) -> f64 {
        self.get(TOTAL_KILOWATT_HOURS).unwrap_or_default()
    }

    /// Emissions of one pollutant in kilograms.
    #[must_use]
    pub fn pollutant(&self, pollutant: Pollutant) -> f64 {
        self.get(pollutant.name()).unwrap_or_default()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Number of metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Start and end of one sampling session.
///
/// Wall-clock timestamps are kept for reporting; the duration is measured
/// with a monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SessionWindow {
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    started: Instant,
    elapsed: Option<Duration>,
}

impl SessionWindow {
    /// Opens a window starting now.
    #[must_use]
    pub fn open() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            started: Instant::now(),
            elapsed: None,
        }
    }

    /// Closes the window now. Closing twice keeps the first end time.
    pub fn close(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.elapsed());
            self.end_time = Some(Utc::now());
        }
    }

    /// Wall-clock start.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Wall-clock end, once closed.
    #[must_use]
    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.elapsed.is_some()
    }

    /// Session duration, defined only once closed.
    #[must_use]
    pub const fn duration(&self) -> Option<Duration> {
        self.elapsed
    }
}
