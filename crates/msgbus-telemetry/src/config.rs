//! Telemetry configuration from environment variables.

use std::env;

/// Logging and metrics settings for one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// Whether to write logs to stdout
    pub console_output: bool,

    /// JSON lines instead of the pretty development format
    pub json_logs: bool,

    /// Whether to register the Prometheus collectors
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "msgbus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MSGBUS_SERVICE_NAME`: Service name (default: msgbus)
    /// - `MSGBUS_LOG_LEVEL`: Log level (default: info); `RUST_LOG` wins at init
    /// - `MSGBUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `MSGBUS_JSON_LOGS`: JSON logs (default: false in dev, true in containers)
    /// - `MSGBUS_METRICS`: Register Prometheus collectors (default: true)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();
        let defaults = Self::default();

        Self {
            service_name: env::var("MSGBUS_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: env::var("MSGBUS_LOG_LEVEL").unwrap_or(defaults.log_level),

            console_output: env::var("MSGBUS_CONSOLE_OUTPUT")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.console_output),

            json_logs: env::var("MSGBUS_JSON_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(is_container),

            metrics_enabled: env::var("MSGBUS_METRICS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.metrics_enabled),
        }
    }

    /// Environment configuration with the service name fixed.
    pub fn for_service(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
            ..Self::from_env()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "msgbus");
        assert_eq!(config.log_level, "info");
        assert!(config.console_output);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_for_service() {
        let config = TelemetryConfig::for_service("registry");
        assert_eq!(config.service_name, "registry");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
