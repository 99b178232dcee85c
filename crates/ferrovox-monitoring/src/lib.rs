//! ferrovox monitoring
//!
//! Plugs a Prometheus registry into the core's [`MetricsSink`] and sets up
//! `tracing` output. Serving the exposition text is left to the host process.
//!
//! [`MetricsSink`]: ferrovox_kernel::MetricsSink

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use metrics::PrometheusMetrics;

/// Errors from metrics registration, encoding or logging setup
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MonitoringError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics encoding error: {0}")]
    Encoding(String),

    #[error("logging setup error: {0}")]
    Logging(String),
}
