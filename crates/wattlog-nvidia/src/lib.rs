//! NVIDIA power provider for wattlog.
#![forbid(unsafe_code)]
//!
//! Reads board power draw through `nvidia-smi`. Acquire an [`NvidiaSmi`]
//! handle once, then share it with as many [`NvidiaPowerProvider`]s as needed:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wattlog_core::{EnergySession, SamplerConfig, TracingSink};
//! use wattlog_nvidia::{NvidiaPowerProvider, NvidiaSmi};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let smi = NvidiaSmi::acquire()?;
//! let provider = Arc::new(NvidiaPowerProvider::new(smi));
//! let session = EnergySession::new(provider, SamplerConfig::default())?;
//!
//! session.run(|| { /* train */ })?;
//! session.finish(&TracingSink)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod provider;
pub mod smi;

pub use provider::{device_id, readings_from_samples, NvidiaPowerProvider};
pub use smi::{parse_device_info_csv, parse_power_csv, DeviceInfo, NvidiaSmi, PowerSample, DEFAULT_NVIDIA_SMI};
