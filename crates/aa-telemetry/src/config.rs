//! Telemetry configuration from environment variables.

use std::env;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to log lines
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full `EnvFilter` directive
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to include source file and line in log lines
    pub with_source: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "aa-engine".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_source: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AA_SERVICE_NAME`: Service name (default: aa-engine)
    /// - `AA_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `AA_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    /// - `AA_LOG_SOURCE`: Include file and line (default: false)
    #[must_use]
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("AA_SERVICE_NAME").unwrap_or_else(|_| "aa-engine".to_string()),

            log_level: env::var("AA_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            json_logs: env::var("AA_JSON_LOGS")
                .map(|v| flag(&v))
                .unwrap_or(is_container),

            with_source: env::var("AA_LOG_SOURCE").map(|v| flag(&v)).unwrap_or(false),
        }
    }

    /// Configuration for one subsystem crate.
    #[must_use]
    pub fn for_subsystem(subsystem_id: u8, subsystem_name: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = format!("aa-{subsystem_id:02}-{}", subsystem_name.to_lowercase().replace(' ', "-"));
        config
    }
}

fn flag(v: &str) -> bool {
    v.eq_ignore_ascii_case("true") || v == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "aa-engine");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_for_subsystem() {
        let config = TelemetryConfig::for_subsystem(2, "AA Trigger Handler");
        assert_eq!(config.service_name, "aa-02-aa-trigger-handler");
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag("TRUE"));
        assert!(flag("1"));
        assert!(!flag("no"));
    }
}
