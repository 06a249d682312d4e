//! Shared configuration, error types, IDs, and observability primitives for colex crates.
//!
//! Architecture role:
//! - defines processor configuration resolved by the bootstrap
//! - provides common [`ColexError`] / [`Result`] contracts and wire status codes
//! - hosts the injected metrics registry and the engine memory budget
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::{ProcessorConfig, ROWS_PER_BLOCK};
pub use error::{ColexError, Result};
pub use ids::*;
pub use memory::{MemoryManager, MemoryPressure, MemoryPressureSignal, MemoryReservation};
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
