//! Background device power sampling and session energy accounting.
#![forbid(unsafe_code)]
//!
//! `wattlog-core` samples the power draw of a set of devices on a background
//! thread while some long-running work executes, then turns the collected
//! samples into energy (kWh) and emissions (kg of CO2e, CO2, CH4, N2O).
//!
//! # Components
//!
//! - [`PowerProvider`]: the device backend (vendor crates implement it)
//! - [`RepeatingTask`]: cancellable, self-rescheduling tick driver
//! - [`MetricAccumulator`]: thread-safe append-only sample store
//! - [`DeviceLogger`]: a provider sampled by a repeating task
//! - [`ConversionPolicy`]: samples + duration to [`DerivedMetrics`]
//! - [`EnergySession`]: start/stop lifecycle feeding a [`MetricsSink`]
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wattlog_core::{EnergySession, FakePowerProvider, MemorySink, SamplerConfig};
//!
//! let provider = Arc::new(FakePowerProvider::uniform(2, 250_000.0));
//! let config = SamplerConfig::with_interval(Duration::from_millis(10));
//! let session = EnergySession::new(provider, config).unwrap();
//!
//! session.run(|| std::thread::sleep(Duration::from_millis(50))).unwrap();
//!
//! let sink = MemorySink::new();
//! let metrics = session.finish(&sink).unwrap();
//! assert!(metrics.total_kilowatt_hours() >= 0.0);
//! ```

#![doc(html_root_url = "https://docs.rs/wattlog-core/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod accumulator;
pub mod config;
pub mod convert;
pub mod error;
pub mod provider;
pub mod sampler;
pub mod scheduler;
pub mod session;
pub mod types;

// Re-export main types at crate root
pub use accumulator::MetricAccumulator;
pub use config::SamplerConfig;
pub use convert::{convert, ConversionPolicy, IntegratedPowerPolicy, PolicyKind, SummedPowerPolicy};
pub use error::{EnergyError, ProviderError, Result};
pub use provider::{FakePowerProvider, PowerProvider};
pub use sampler::{DeviceLogger, DeviceSampler, SampleFailure, SamplerStats};
pub use scheduler::{RepeatingTask, TaskHandle, TaskState, TickHandler};
pub use session::{EnergySession, MemorySink, MetricsSink, TracingSink};
pub use types::{DerivedMetrics, DeviceReading, MetricSeries, Pollutant, SessionWindow};
