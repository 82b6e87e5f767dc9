//! Media server configuration from environment variables.

use crate::error::ConfigError;
use stanza_bus::{DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_MAX_COLLECTORS};
use std::env;
use std::time::Duration;

/// Where the media server lives on the stanza network and whom it asks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaServerConfig {
    /// Our own component address
    pub component_jid: String,

    /// Service answering credential checks
    pub auth_service: String,

    /// Pub-sub server owning channel metadata
    pub pubsub_server: String,

    /// Wait for a reply before reporting the service unavailable
    pub exchange_timeout: Duration,

    /// Bound on concurrently pending exchanges
    pub max_pending: usize,

    /// Public HTTP API endpoint advertised through service discovery
    pub http_endpoint: Option<String>,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            component_jid: "media.localhost".to_string(),
            auth_service: "auth.localhost".to_string(),
            pubsub_server: "pubsub.localhost".to_string(),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            max_pending: DEFAULT_MAX_COLLECTORS,
            http_endpoint: None,
        }
    }
}

impl MediaServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// # Environment Variables
    ///
    /// - `MEDIA_COMPONENT_JID` (default: media.localhost)
    /// - `MEDIA_AUTH_SERVICE` (default: auth.localhost)
    /// - `MEDIA_PUBSUB_SERVER` (default: pubsub.localhost)
    /// - `MEDIA_EXCHANGE_TIMEOUT_MS` (default: 5000)
    /// - `MEDIA_MAX_PENDING` (default: 10000)
    /// - `MEDIA_HTTP_ENDPOINT` (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let exchange_timeout = match lookup("MEDIA_EXCHANGE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_number("MEDIA_EXCHANGE_TIMEOUT_MS", raw)?),
            None => defaults.exchange_timeout,
        };
        let max_pending = match lookup("MEDIA_MAX_PENDING") {
            Some(raw) => parse_number("MEDIA_MAX_PENDING", raw)?,
            None => defaults.max_pending,
        };

        let config = Self {
            component_jid: lookup("MEDIA_COMPONENT_JID").unwrap_or(defaults.component_jid),
            auth_service: lookup("MEDIA_AUTH_SERVICE").unwrap_or(defaults.auth_service),
            pubsub_server: lookup("MEDIA_PUBSUB_SERVER").unwrap_or(defaults.pubsub_server),
            exchange_timeout,
            max_pending,
            http_endpoint: lookup("MEDIA_HTTP_ENDPOINT").filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("component_jid", &self.component_jid),
            ("auth_service", &self.auth_service),
            ("pubsub_server", &self.pubsub_server),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyIdentity { field });
            }
        }

        if self.exchange_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        if self.max_pending == 0 {
            return Err(ConfigError::InvalidMaxPending);
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Parse { var, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MediaServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, MediaServerConfig::default());
        assert_eq!(config.exchange_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_pending, 10_000);
        assert!(config.http_endpoint.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = MediaServerConfig::from_lookup(lookup_from(&[
            ("MEDIA_COMPONENT_JID", "media.example.com"),
            ("MEDIA_EXCHANGE_TIMEOUT_MS", "250"),
            ("MEDIA_MAX_PENDING", "64"),
            ("MEDIA_HTTP_ENDPOINT", "https://api.example.com"),
        ]))
        .unwrap();

        assert_eq!(config.component_jid, "media.example.com");
        assert_eq!(config.exchange_timeout, Duration::from_millis(250));
        assert_eq!(config.max_pending, 64);
        assert_eq!(
            config.http_endpoint.as_deref(),
            Some("https://api.example.com")
        );
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            MediaServerConfig::from_lookup(lookup_from(&[("MEDIA_MAX_PENDING", "lots")])),
            Err(ConfigError::Parse {
                var: "MEDIA_MAX_PENDING",
                value: "lots".into()
            })
        );
        assert_eq!(
            MediaServerConfig::from_lookup(lookup_from(&[("MEDIA_EXCHANGE_TIMEOUT_MS", "0")])),
            Err(ConfigError::InvalidTimeout)
        );
        assert_eq!(
            MediaServerConfig::from_lookup(lookup_from(&[("MEDIA_AUTH_SERVICE", " ")])),
            Err(ConfigError::EmptyIdentity {
                field: "auth_service"
            })
        );
    }

    #[test]
    fn test_zero_max_pending_rejected() {
        let config = MediaServerConfig {
            max_pending: 0,
            ..MediaServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPending));
    }
}
