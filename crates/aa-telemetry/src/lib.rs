//! # AA Telemetry
//!
//! Structured logging and Prometheus metrics for the AA engine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aa_telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::from_env())?;
//! // handled triggers now show up in logs and in gather_metrics()
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AA_SERVICE_NAME` | `aa-engine` | Service name in logs |
//! | `AA_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `AA_JSON_LOGS` | `false` | JSON log lines |
//! | `AA_LOG_SOURCE` | `false` | File and line in log lines |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_tracing};
pub use metrics::{gather_metrics, register_metrics};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The subscriber could not be installed.
    #[error("Failed to initialize tracing: {0}")]
    TracingInit(String),

    /// A metric could not be registered or encoded.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Bad configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Registers metrics and installs the global `tracing` subscriber.
///
/// # Errors
///
/// See [`register_metrics`] and [`init_tracing`].
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_tracing(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_config_error() {
        std::env::remove_var("RUST_LOG");
        let config = TelemetryConfig { log_level: "aa=verbose".into(), ..TelemetryConfig::default() };
        assert!(matches!(env_filter(&config), Err(TelemetryError::Config(_))));
    }
}
