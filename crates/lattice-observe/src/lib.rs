//! # Lattice Observe
//!
//! Structured logging initialization and in-process operation metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{MetricsSnapshot, NodeMetrics, OpTimer};

/// Initialize observability with defaults. Suitable for tools and tests;
/// the server configures [`LogConfig`] explicitly.
pub fn init() -> anyhow::Result<()> {
    init_logging(LogConfig::default())
}
