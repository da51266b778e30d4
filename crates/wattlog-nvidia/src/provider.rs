//! [`PowerProvider`] backed by an [`NvidiaSmi`] handle.

use std::sync::Arc;

use tracing::trace;
use wattlog_core::{DeviceReading, PowerProvider, ProviderError};

use crate::smi::{DeviceInfo, NvidiaSmi, PowerSample};

/// Reads board power of every device enumerated by an [`NvidiaSmi`] handle.
#[derive(Debug, Clone)]
pub struct NvidiaPowerProvider {
    smi: Arc<NvidiaSmi>,
}

impl NvidiaPowerProvider {
    /// Creates a provider over an acquired handle.
    #[must_use]
    pub fn new(smi: Arc<NvidiaSmi>) -> Self {
        Self { smi }
    }

    /// The shared handle.
    #[must_use]
    pub fn smi(&self) -> &Arc<NvidiaSmi> {
        &self.smi
    }
}

/// Device id under which a GPU's samples are recorded.
#[must_use]
pub fn device_id(index: u32) -> String {
    format!("gpu_{index}_power")
}

/// Turns a power query into readings for the known devices, in milliwatts.
///
/// Rows for devices that were not enumerated, or that report no power, are
/// dropped.
#[must_use]
pub fn readings_from_samples(samples: &[PowerSample], known: &[DeviceInfo]) -> Vec<DeviceReading> {
    samples
        .iter()
        .filter(|s| known.iter().any(|d| d.index == s.index))
        .filter_map(|s| {
            s.power_watts
                .map(|watts| DeviceReading::new(device_id(s.index), watts * 1000.0))
        })
        .collect()
}

impl PowerProvider for NvidiaPowerProvider {
    fn device_count(&self) -> usize {
        self.smi.device_count()
    }

    fn read_all(&self) -> Result<Vec<DeviceReading>, ProviderError> {
        let samples = self.smi.query_power()?;
        let readings = readings_from_samples(&samples, self.smi.devices());
        trace!(
            rows = samples.len(),
            readings = readings.len(),
            "read nvidia power"
        );
        Ok(readings)
    }

    fn name(&self) -> &'static str {
        "NvidiaPowerProvider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32) -> DeviceInfo {
        DeviceInfo {
            index,
            name: format!("Tesla T4 #{index}"),
            uuid: format!("GPU-{index}"),
            memory_total_mib: 15360,
        }
    }

    #[test]
    fn test_device_ids_follow_index() {
        assert_eq!(device_id(0), "gpu_0_power");
        assert_eq!(device_id(7), "gpu_7_power");
    }

    #[test]
    fn test_watts_become_milliwatts() {
        let samples = [
            PowerSample { index: 0, power_watts: Some(250.5) },
            PowerSample { index: 1, power_watts: Some(70.0) },
        ];

        let readings = readings_from_samples(&samples, &[device(0), device(1)]);

        assert_eq!(
            readings,
            vec![
                DeviceReading::new("gpu_0_power", 250_500.0),
                DeviceReading::new("gpu_1_power", 70_000.0),
            ]
        );
    }

    #[test]
    fn test_unreported_power_is_skipped() {
        let samples = [
            PowerSample { index: 0, power_watts: None },
            PowerSample { index: 1, power_watts: Some(1.0) },
        ];

        let readings = readings_from_samples(&samples, &[device(0), device(1)]);
        assert_eq!(readings, vec![DeviceReading::new("gpu_1_power", 1000.0)]);
    }

    #[test]
    fn test_unknown_devices_are_skipped() {
        let samples = [
            PowerSample { index: 0, power_watts: Some(1.0) },
            PowerSample { index: 3, power_watts: Some(1.0) },
        ];

        let readings = readings_from_samples(&samples, &[device(0)]);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "gpu_0_power");
    }
}
