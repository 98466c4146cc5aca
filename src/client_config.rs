//! Public, transport-agnostic client configuration.
//!
//! Identity fields are shared by every transport. Anything only one backend
//! understands lives in [`TransportOptions`] and is interpreted by that
//! transport alone.

use std::fmt;

use crate::{MqError, Result};

/// Environment variable names read by [`ClientConfig::from_env`].
pub mod env {
    pub const ENDPOINT: &str = "MQ_ENDPOINT";
    pub const ACCESS_KEY_ID: &str = "MQ_ACCESS_KEY_ID";
    pub const ACCESS_KEY_SECRET: &str = "MQ_ACCESS_KEY_SECRET";
    pub const INSTANCE_ID: &str = "MQ_INSTANCE_ID";
    pub const LOG_LEVEL: &str = "MQ_LOG_LEVEL";
    pub const CONSUME_THREADS: &str = "MQ_CONSUME_THREADS";
    pub const PROXY_ENDPOINT: &str = "MQ_PROXY_ENDPOINT";
}

/// Backend-specific knobs passed through to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Log level for the underlying driver (`debug`, `info`, `warn`, ...).
    pub log_level: Option<String>,

    /// Consumer concurrency inside the driver. The driver default applies
    /// when `None`.
    pub consume_threads: Option<u32>,

    /// Address of an out-of-process proxy, for RPC-backed transports.
    pub proxy_endpoint: Option<String>,
}

/// Broker connection identity.
///
/// Immutable once a client has been built from it. All four identity fields
/// must be non-empty; see [`validate`](Self::validate).
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    // ---
    /// Broker name-server or gateway address.
    pub endpoint: String,

    /// Access key used to sign broker requests.
    pub access_key_id: String,

    /// Secret paired with `access_key_id`. Redacted from `Debug` output.
    pub access_key_secret: String,

    /// Broker instance the client belongs to.
    pub instance_id: String,

    /// Backend-specific options.
    pub transport_options: TransportOptions,
}

impl ClientConfig {
    /// Create a config with default transport options.
    pub fn new(
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            endpoint: endpoint.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            instance_id: instance_id.into(),
            transport_options: TransportOptions::default(),
        }
    }

    /// Load a config from `MQ_*` environment variables.
    ///
    /// Missing identity variables yield empty fields, which
    /// [`validate`](Self::validate) then rejects. Unparsable numeric options
    /// fall back to the transport default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            endpoint: var(env::ENDPOINT).unwrap_or_default(),
            access_key_id: var(env::ACCESS_KEY_ID).unwrap_or_default(),
            access_key_secret: var(env::ACCESS_KEY_SECRET).unwrap_or_default(),
            instance_id: var(env::INSTANCE_ID).unwrap_or_default(),
            transport_options: TransportOptions {
                log_level: var(env::LOG_LEVEL),
                consume_threads: var(env::CONSUME_THREADS).and_then(|v| v.parse().ok()),
                proxy_endpoint: var(env::PROXY_ENDPOINT),
            },
        }
    }

    /// Set the driver log level.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.transport_options.log_level = Some(level.into());
        self
    }

    /// Set the driver consumer concurrency.
    pub fn with_consume_threads(mut self, threads: u32) -> Self {
        self.transport_options.consume_threads = Some(threads);
        self
    }

    /// Set the proxy address for RPC-backed transports.
    pub fn with_proxy_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.transport_options.proxy_endpoint = Some(endpoint.into());
        self
    }

    /// Check that every identity field is present.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Validation`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        // ---
        let fields = [
            ("endpoint", &self.endpoint),
            ("access_key_id", &self.access_key_id),
            ("access_key_secret", &self.access_key_secret),
            ("instance_id", &self.instance_id),
        ];

        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(MqError::Validation(format!("{name} must not be empty")));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("instance_id", &self.instance_id)
            .field("transport_options", &self.transport_options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashMap;

    fn sample() -> ClientConfig {
        ClientConfig::new("http://ns:9876", "ak", "sk", "inst-1")
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        // ---
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_names_missing_field() {
        // ---
        let mut config = sample();
        config.access_key_secret = "   ".into();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, MqError::Validation(ref m) if m.contains("access_key_secret")));
    }

    #[test]
    fn test_debug_redacts_secret() {
        // ---
        let rendered = format!("{:?}", sample());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"sk\""));
    }

    #[test]
    fn test_from_lookup() {
        // ---
        let vars: HashMap<&str, &str> = [
            (env::ENDPOINT, "http://ns:9876"),
            (env::ACCESS_KEY_ID, "ak"),
            (env::ACCESS_KEY_SECRET, "sk"),
            (env::INSTANCE_ID, "inst-1"),
            (env::CONSUME_THREADS, "not-a-number"),
            (env::LOG_LEVEL, "warn"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert!(config.validate().is_ok());
        assert_eq!(config.transport_options.log_level.as_deref(), Some("warn"));
        assert_eq!(config.transport_options.consume_threads, None);
        assert_eq!(config.transport_options.proxy_endpoint, None);
    }
}
