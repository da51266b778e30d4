//! Conversion of a session's power samples into energy and emissions.
//!
//! The default [`SummedPowerPolicy`] adds up every raw sample and multiplies
//! by the session length. It does not divide by the number of ticks, so its
//! output grows with the sampling rate. [`IntegratedPowerPolicy`] weights each
//! sample by the tick interval instead, giving a true energy integral.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EnergyError;
use crate::types::{DerivedMetrics, MetricSeries};

const MILLIWATTS_TO_KILOWATTS: f64 = 1e-6;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Turns a finished session into derived metrics.
///
/// Implementations must be pure: the same inputs always give the same output.
pub trait ConversionPolicy: Send + Sync + fmt::Debug {
    /// Converts `series` sampled over `duration` into derived metrics.
    fn convert(&self, series: &MetricSeries, duration: Duration) -> DerivedMetrics;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Sum of all samples times session hours.
///
/// `kWh = (Σ mW × 1e-6) × (duration_s / 3600)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummedPowerPolicy;

impl ConversionPolicy for SummedPowerPolicy {
    fn convert(&self, series: &MetricSeries, duration: Duration) -> DerivedMetrics {
        let total_milliwatts = series.total_milliwatts();
        let total_kilowatts = total_milliwatts * MILLIWATTS_TO_KILOWATTS;
        let total_hours = duration.as_secs_f64() / SECONDS_PER_HOUR;
        let kilowatt_hours = total_hours * total_kilowatts;

        debug!(
            policy = self.name(),
            samples = series.total_samples(),
            total_milliwatts,
            total_hours,
            kilowatt_hours,
            "converted session"
        );

        DerivedMetrics::from_kilowatt_hours(kilowatt_hours)
    }

    fn name(&self) -> &'static str {
        "summed"
    }
}

/// Each sample counts for one tick interval of energy.
///
/// `kWh = Σ (mW × 1e-6 × interval_s / 3600)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegratedPowerPolicy {
    interval: Duration,
}

impl IntegratedPowerPolicy {
    /// Creates a policy for samples taken every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The tick interval each sample stands for.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

impl ConversionPolicy for IntegratedPowerPolicy {
    fn convert(&self, series: &MetricSeries, duration: Duration) -> DerivedMetrics {
        if duration.is_zero() {
            return DerivedMetrics::from_kilowatt_hours(0.0);
        }

        let sample_hours = self.interval.as_secs_f64() / SECONDS_PER_HOUR;
        let kilowatt_hours = series.total_milliwatts() * MILLIWATTS_TO_KILOWATTS * sample_hours;

        debug!(
            policy = self.name(),
            samples = series.total_samples(),
            interval = ?self.interval,
            kilowatt_hours,
            "converted session"
        );

        DerivedMetrics::from_kilowatt_hours(kilowatt_hours)
    }

    fn name(&self) -> &'static str {
        "integrated"
    }
}

/// Converts with the default [`SummedPowerPolicy`].
#[must_use]
pub fn convert(series: &MetricSeries, duration: Duration) -> DerivedMetrics {
    SummedPowerPolicy.convert(series, duration)
}

/// Selects a built-in policy from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// [`SummedPowerPolicy`].
    #[default]
    Summed,
    /// [`IntegratedPowerPolicy`].
    Integrated,
}

impl PolicyKind {
    /// Builds the policy for a sampler ticking every `interval`.
    #[must_use]
    pub fn build(self, interval: Duration) -> Box<dyn ConversionPolicy> {
        match self {
            Self::Summed => Box::new(SummedPowerPolicy),
            Self::Integrated => Box::new(IntegratedPowerPolicy::new(interval)),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Summed => write!(f, "summed"),
            Self::Integrated => write!(f, "integrated"),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = EnergyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "summed" => Ok(Self::Summed),
            "integrated" => Ok(Self::Integrated),
            other => Err(EnergyError::InvalidConfig(format!(
                "unknown conversion policy '{other}' (expected summed or integrated)"
            ))),
        }
    }
}
