//! Client builder.
//!
//! Fluent alternative to [`MqClient::new`] for assembling a
//! [`ClientConfig`] field by field.

use std::sync::Arc;

use crate::{
    // ---
    log_info,
    ClientConfig,
    MemoryConnector,
    MqClient,
    Result,
    TransportConnector,
    TransportOptions,
};

/// Builder for [`MqClient`].
///
/// Identity fields are required; [`build`](Self::build) fails fast with
/// [`MqError::Validation`](crate::MqError::Validation) naming the first one
/// missing. Without an explicit [`connector`](Self::connector) the client
/// runs on the process-global in-memory hub.
///
/// # Examples
///
/// ```
/// use mq_bridge::{MemoryConnector, MemoryHub, MqClientBuilder};
///
/// let client = MqClientBuilder::new()
///     .endpoint("http://broker.local:8080")
///     .access_key_id("ak")
///     .access_key_secret("sk")
///     .instance_id("I1")
///     .consume_threads(4)
///     .connector(MemoryConnector::with_hub(MemoryHub::new()))
///     .build()
///     .unwrap();
///
/// assert!(!client.is_connected());
/// ```
#[derive(Default)]
pub struct MqClientBuilder {
    // ---
    endpoint: Option<String>,
    access_key_id: Option<String>,
    access_key_secret: Option<String>,
    instance_id: Option<String>,
    transport_options: TransportOptions,
    connector: Option<Arc<dyn TransportConnector>>,
}

impl MqClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config, e.g. one loaded with
    /// [`ClientConfig::from_env`].
    pub fn from_config(config: ClientConfig) -> Self {
        // ---
        Self {
            endpoint: Some(config.endpoint),
            access_key_id: Some(config.access_key_id),
            access_key_secret: Some(config.access_key_secret),
            instance_id: Some(config.instance_id),
            transport_options: config.transport_options,
            connector: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn access_key_id(mut self, key: impl Into<String>) -> Self {
        self.access_key_id = Some(key.into());
        self
    }

    pub fn access_key_secret(mut self, secret: impl Into<String>) -> Self {
        self.access_key_secret = Some(secret.into());
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Driver log level, passed through to the transport.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.transport_options.log_level = Some(level.into());
        self
    }

    /// Driver consumer concurrency.
    pub fn consume_threads(mut self, threads: u32) -> Self {
        self.transport_options.consume_threads = Some(threads);
        self
    }

    /// Proxy address for RPC-backed transports.
    pub fn proxy_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.transport_options.proxy_endpoint = Some(endpoint.into());
        self
    }

    /// Set how the transport is created on first use.
    pub fn connector<C>(mut self, connector: C) -> Self
    where
        C: TransportConnector + 'static,
    {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Validate and build the client (consumes self). Does not connect.
    pub fn build(self) -> Result<MqClient> {
        // ---
        let config = ClientConfig {
            endpoint: self.endpoint.unwrap_or_default(),
            access_key_id: self.access_key_id.unwrap_or_default(),
            access_key_secret: self.access_key_secret.unwrap_or_default(),
            instance_id: self.instance_id.unwrap_or_default(),
            transport_options: self.transport_options,
        };

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                log_info!("no connector configured, using the in-memory transport");
                Arc::new(MemoryConnector::new())
            }
        };

        MqClient::with_connector(config, connector)
    }
}
