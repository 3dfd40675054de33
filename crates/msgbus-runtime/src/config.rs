//! # Runtime Configuration
//!
//! Service identity and queue wiring, read from the environment.

use msgbus::{BusConfig, ExchangeKind, QueueBinding, RoutingKey};
use msgbus_telemetry::TelemetryConfig;
use std::env;
use thiserror::Error;

/// Exchange services bind to when none is configured.
pub const DEFAULT_EXCHANGE: &str = "node.events";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Organization segment of every routing key.
    pub org: String,
    /// System segment.
    pub system: String,
    /// Service segment; also the default queue name.
    pub service: String,
    /// Exchange, queue and keys the service consumes.
    pub binding: QueueBinding,
    /// Consumer tag of the service subscription.
    pub consumer_tag: String,
    pub bus: BusConfig,
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MSGBUS_ORG`, `MSGBUS_SYSTEM`, `MSGBUS_SERVICE`: Service identity (required)
    /// - `MSGBUS_BINDING`: Queue binding as JSON; overrides the variables below
    /// - `MSGBUS_EXCHANGE`: Exchange (default: node.events)
    /// - `MSGBUS_EXCHANGE_KIND`: Exchange kind (default: topic)
    /// - `MSGBUS_QUEUE`: Queue (default: the service name)
    /// - `MSGBUS_REQUEST_KEYS`, `MSGBUS_RESPONSE_KEYS`: Comma-separated keys;
    ///   `{{ .Org}}` is replaced by the organization
    /// - `MSGBUS_CONSUMER_TAG`: Consumer tag (default: the service name)
    ///
    /// Broker settings come from `BusConfig::from_env`, logging from
    /// `TelemetryConfig::for_service`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        config.bus = BusConfig::from_env();
        if env::var("MSGBUS_CONNECTION_NAME").is_err() {
            config.bus.connection_name = config.service.clone();
        }
        config.telemetry = TelemetryConfig::for_service(&config.service);
        Ok(config)
    }

    /// Build the service part of the configuration from `lookup`. Broker and
    /// telemetry settings are left at their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        let org = required("MSGBUS_ORG")?;
        let system = required("MSGBUS_SYSTEM")?;
        let service = required("MSGBUS_SERVICE")?;

        let binding = match lookup("MSGBUS_BINDING") {
            Some(json) => {
                let binding: QueueBinding =
                    serde_json::from_str(&json).map_err(|e| ConfigError::Invalid {
                        var: "MSGBUS_BINDING",
                        reason: e.to_string(),
                    })?;
                prepare_binding(binding, &org)
            }
            None => {
                let exchange_kind = match lookup("MSGBUS_EXCHANGE_KIND") {
                    Some(kind) => kind
                        .parse::<ExchangeKind>()
                        .map_err(|e| ConfigError::Invalid {
                            var: "MSGBUS_EXCHANGE_KIND",
                            reason: e.to_string(),
                        })?,
                    None => ExchangeKind::Topic,
                };
                QueueBinding {
                    exchange: lookup("MSGBUS_EXCHANGE")
                        .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
                    queue: lookup("MSGBUS_QUEUE").unwrap_or_else(|| service.clone()),
                    exchange_kind,
                    request_routing_keys: parse_keys(lookup("MSGBUS_REQUEST_KEYS"), &org),
                    response_routing_keys: parse_keys(lookup("MSGBUS_RESPONSE_KEYS"), &org),
                }
            }
        };

        Ok(Self {
            consumer_tag: lookup("MSGBUS_CONSUMER_TAG").unwrap_or_else(|| service.clone()),
            org,
            system,
            binding,
            service,
            bus: BusConfig::default(),
            telemetry: TelemetryConfig::default(),
        })
    }
}

fn parse_keys(value: Option<String>, org: &str) -> Vec<RoutingKey> {
    value
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| RoutingKey::prepare(org, k))
        .collect()
}

fn prepare_binding(mut binding: QueueBinding, org: &str) -> QueueBinding {
    for key in binding
        .request_routing_keys
        .iter_mut()
        .chain(binding.response_routing_keys.iter_mut())
    {
        *key = RoutingKey::prepare(org, key.as_str());
    }
    binding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const IDENTITY: [(&str, &str); 3] = [
        ("MSGBUS_ORG", "acme"),
        ("MSGBUS_SYSTEM", "registry"),
        ("MSGBUS_SERVICE", "node"),
    ];

    #[test]
    fn test_defaults_from_identity() {
        let config = RuntimeConfig::from_lookup(lookup(&IDENTITY)).unwrap();

        assert_eq!(config.binding.exchange, DEFAULT_EXCHANGE);
        assert_eq!(config.binding.queue, "node");
        assert_eq!(config.binding.exchange_kind, ExchangeKind::Topic);
        assert!(config.binding.request_routing_keys.is_empty());
        assert_eq!(config.consumer_tag, "node");
    }

    #[test]
    fn test_missing_identity() {
        let err = RuntimeConfig::from_lookup(lookup(&[("MSGBUS_ORG", "acme")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("MSGBUS_SYSTEM")));
    }

    #[test]
    fn test_keys_are_prepared_with_org() {
        let mut vars = IDENTITY.to_vec();
        vars.push((
            "MSGBUS_REQUEST_KEYS",
            "request.cloud.{{ .Org}}.registry.node.node.create, event.cloud.*.registry.#",
        ));
        let config = RuntimeConfig::from_lookup(lookup(&vars)).unwrap();

        let keys: Vec<&str> = config
            .binding
            .request_routing_keys
            .iter()
            .map(RoutingKey::as_str)
            .collect();
        assert_eq!(
            keys,
            vec!["request.cloud.acme.registry.node.node.create", "event.cloud.*.registry.#"]
        );
    }

    #[test]
    fn test_binding_json() {
        let mut vars = IDENTITY.to_vec();
        vars.push((
            "MSGBUS_BINDING",
            r#"{"exchange":"E","queue":"q","exchange_kind":"direct","request_routing_keys":["a.{{ .Org}}.b"]}"#,
        ));
        let config = RuntimeConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.binding.exchange, "E");
        assert_eq!(config.binding.exchange_kind, ExchangeKind::Direct);
        assert_eq!(config.binding.request_routing_keys[0].as_str(), "a.acme.b");
    }

    #[test]
    fn test_invalid_exchange_kind() {
        let mut vars = IDENTITY.to_vec();
        vars.push(("MSGBUS_EXCHANGE_KIND", "broadcast"));
        let err = RuntimeConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MSGBUS_EXCHANGE_KIND", .. }));
    }
}
