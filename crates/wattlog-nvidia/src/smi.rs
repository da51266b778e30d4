//! The `nvidia-smi` handle and its CSV output parsers.

use std::io::ErrorKind;
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wattlog_core::ProviderError;

/// Binary looked up on `PATH` when no explicit path is given.
pub const DEFAULT_NVIDIA_SMI: &str = "nvidia-smi";

const DEVICE_QUERY: &str = "--query-gpu=index,name,memory.total,uuid";
const POWER_QUERY: &str = "--query-gpu=index,power.draw";
const CSV_FORMAT: &str = "--format=csv,noheader";

/// A device enumerated when the handle was acquired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// GPU index (0-based).
    pub index: u32,
    /// GPU name/model (e.g., "NVIDIA A100").
    pub name: String,
    /// GPU UUID.
    pub uuid: String,
    /// Total memory in MiB.
    pub memory_total_mib: u64,
}

/// One row of a power query. `power_watts` is `None` when the device does not
/// report power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    /// GPU index (0-based).
    pub index: u32,
    /// Instantaneous board power draw in watts.
    pub power_watts: Option<f64>,
}

/// An initialized `nvidia-smi` session.
///
/// Acquiring the handle checks that the tool answers and enumerates the
/// devices once. Providers share it through an [`Arc`]; the last owner to
/// drop it releases it.
#[derive(Debug)]
pub struct NvidiaSmi {
    path: String,
    devices: Vec<DeviceInfo>,
}

impl NvidiaSmi {
    /// Acquires the handle using `nvidia-smi` from `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unavailable` if the tool cannot be run, or a
    /// query/parse error if enumeration fails.
    pub fn acquire() -> Result<Arc<Self>, ProviderError> {
        Self::acquire_with_path(DEFAULT_NVIDIA_SMI)
    }

    /// Acquires the handle using the binary at `path`.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub fn acquire_with_path(path: impl Into<String>) -> Result<Arc<Self>, ProviderError> {
        let path = path.into();
        let output = run(&path, &[DEVICE_QUERY, CSV_FORMAT])?;
        let devices = parse_device_info_csv(&output)?;

        info!(path = %path, devices = devices.len(), "acquired nvidia-smi");
        Ok(Arc::new(Self { path, devices }))
    }

    /// Devices enumerated at acquisition, in index order as reported.
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Number of enumerated devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Path of the binary this handle runs.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queries the current power draw of every device.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or prints unparseable output.
    pub fn query_power(&self) -> Result<Vec<PowerSample>, ProviderError> {
        let output = run(&self.path, &[POWER_QUERY, CSV_FORMAT])?;
        parse_power_csv(&output)
    }
}

impl Drop for NvidiaSmi {
    fn drop(&mut self) {
        debug!(path = %self.path, "released nvidia-smi");
    }
}

fn run(path: &str, args: &[&str]) -> Result<String, ProviderError> {
    let output = Command::new(path).args(args).output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ProviderError::Unavailable(format!("{path} not found"))
        } else {
            ProviderError::Unavailable(format!("failed to run {path}: {e}"))
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProviderError::Query(format!(
            "{path} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| ProviderError::Parse(format!("invalid {path} output: {e}")))
}

fn parse_index(field: &str) -> Result<u32, ProviderError> {
    field
        .trim()
        .parse::<u32>()
        .map_err(|e| ProviderError::Parse(format!("invalid GPU index {field:?}: {e}")))
}

/// Parses `index, name, memory.total [MiB], uuid` rows.
///
/// Rows with too few columns are skipped.
///
/// # Errors
///
/// Returns `ProviderError::Parse` on a bad index or memory value.
pub fn parse_device_info_csv(output: &str) -> Result<Vec<DeviceInfo>, ProviderError> {
    let mut devices = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(", ").collect();
        if parts.len() < 4 {
            continue;
        }

        let index = parse_index(parts[0])?;
        let memory = parts[2].trim().trim_end_matches("MiB").trim();
        let memory_total_mib = memory
            .parse::<u64>()
            .map_err(|e| ProviderError::Parse(format!("invalid memory value {memory:?}: {e}")))?;

        devices.push(DeviceInfo {
            index,
            name: parts[1].trim().to_string(),
            uuid: parts[3].trim().to_string(),
            memory_total_mib,
        });
    }

    Ok(devices)
}

/// Parses `index, power.draw [W]` rows.
///
/// Bracketed values such as `[N/A]` or `[Not Supported]` yield `None`.
///
/// # Errors
///
/// Returns `ProviderError::Parse` on a bad index or power value.
pub fn parse_power_csv(output: &str) -> Result<Vec<PowerSample>, ProviderError> {
    let mut samples = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((index, power)) = line.split_once(',') else {
            continue;
        };

        let index = parse_index(index)?;
        let power = power.trim().trim_end_matches('W').trim();
        let power_watts = if power.is_empty() || power.starts_with('[') {
            None
        } else {
            Some(power.parse::<f64>().map_err(|e| {
                ProviderError::Parse(format!("invalid power value {power:?}: {e}"))
            })?)
        };

        samples.push(PowerSample { index, power_watts });
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_parse_single_device() {
        let csv = "0, NVIDIA A100-SXM4-80GB, 81920 MiB, GPU-abc123";

        let devices = parse_device_info_csv(csv).expect("should parse");
        assert_eq!(
            devices,
            vec![DeviceInfo {
                index: 0,
                name: "NVIDIA A100-SXM4-80GB".to_string(),
                uuid: "GPU-abc123".to_string(),
                memory_total_mib: 81920,
            }]
        );
    }

    #[test]
    fn test_parse_multiple_devices() {
        let csv = r"0, NVIDIA GeForce RTX 4090, 24564 MiB, GPU-abc123
1, NVIDIA GeForce RTX 4080, 16384 MiB, GPU-def456

2, NVIDIA A100, 81920 MiB, GPU-ghi789
";

        let devices = parse_device_info_csv(csv).expect("should parse");
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].index, 2);
        assert_eq!(devices[2].name, "NVIDIA A100");
        assert_eq!(devices[1].memory_total_mib, 16384);
    }

    #[test]
    fn test_parse_device_skips_malformed_rows() {
        let csv = "No devices were found\n0, Tesla T4, 15360 MiB, GPU-t4";
        let devices = parse_device_info_csv(csv).expect("should parse");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Tesla T4");
    }

    #[test]
    fn test_parse_device_rejects_bad_index() {
        let err = parse_device_info_csv("x, Tesla T4, 15360 MiB, GPU-t4").expect_err("bad index");
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[test]
    fn test_parse_device_rejects_bad_memory() {
        let err = parse_device_info_csv("0, Tesla T4, lots MiB, GPU-t4").expect_err("bad memory");
        assert!(err.to_string().contains("invalid memory value"));
    }

    #[test_case("0, 250.43 W", Some(250.43) ; "with units")]
    #[test_case("0, 71.2", Some(71.2) ; "without units")]
    #[test_case("0, [N/A]", None ; "not available")]
    #[test_case("0, [Not Supported]", None ; "not supported")]
    fn test_parse_power_row(csv: &str, expected: Option<f64>) {
        let samples = parse_power_csv(csv).expect("should parse");
        assert_eq!(samples, vec![PowerSample { index: 0, power_watts: expected }]);
    }

    #[test]
    fn test_parse_power_multiple_rows() {
        let csv = "0, 300.00 W\n1, [N/A]\n2, 55.5 W\n";
        let samples = parse_power_csv(csv).expect("should parse");

        let indices: Vec<u32> = samples.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(samples[1].power_watts, None);
        assert_eq!(samples[2].power_watts, Some(55.5));
    }

    #[test]
    fn test_parse_power_rejects_garbage() {
        let err = parse_power_csv("0, hot W").expect_err("bad power");
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[test]
    fn test_acquire_missing_binary_is_unavailable() {
        let err = NvidiaSmi::acquire_with_path("/nonexistent/wattlog/nvidia-smi")
            .expect_err("binary does not exist");
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn test_device_info_serializes() {
        let info = DeviceInfo {
            index: 1,
            name: "Tesla T4".to_string(),
            uuid: "GPU-t4".to_string(),
            memory_total_mib: 15360,
        };
        let json = serde_json::to_value(&info).expect("serialize");
        assert_eq!(json["memory_total_mib"], 15360);
        assert_eq!(json["uuid"], "GPU-t4");
    }
}
