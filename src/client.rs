//! Client facade.
//!
//! [`MqClient`] owns the transport and the two resource registries. The
//! transport is created on first use, so building a client never touches the
//! network; a connection failure shows up on the first
//! [`get_producer`](MqClient::get_producer),
//! [`get_consumer`](MqClient::get_consumer) or
//! [`health_check`](MqClient::health_check).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::OnceCell;

use crate::domain::settle;
use crate::registry::{ResourceKey, ResourceRegistry};
use crate::{
    // ---
    log_info,
    ClientConfig,
    Consumer,
    ConsumerId,
    HealthState,
    HealthStatus,
    MqClientBuilder,
    MqError,
    Producer,
    ProducerId,
    Result,
    TransportConnector,
    TransportMode,
    TransportPtr,
};

/// Tag expression used when a consumer is requested without one.
pub const DEFAULT_TAG_EXPRESSION: &str = "*";

/// Entry point: hands out producers and consumers over one transport.
///
/// Cheap to clone; clones share the transport and registries.
///
/// ```
/// use mq_bridge::{ClientConfig, MemoryConnector, MqClient};
///
/// # async fn example() -> mq_bridge::Result<()> {
/// let config = ClientConfig::new("mem://", "ak", "sk", "I1");
/// let client = MqClient::new(config, MemoryConnector::new())?;
///
/// let producer = client.get_producer("I1", "orders").await?;
/// producer
///     .publish(&serde_json::json!({"id": 7}), "created", Default::default())
///     .await?;
/// producer.shutdown().await?;
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn TransportConnector>,
    transport: OnceCell<TransportPtr>,
    producers: Arc<ResourceRegistry<ProducerId>>,
    consumers: Arc<ResourceRegistry<ConsumerId>>,
    closed: AtomicBool,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MqError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

impl MqClient {
    /// Create a client. Does not connect.
    ///
    /// # Errors
    ///
    /// [`MqError::Validation`] if `config` is incomplete.
    pub fn new<C>(config: ClientConfig, connector: C) -> Result<Self>
    where
        C: TransportConnector + 'static,
    {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn builder() -> MqClientBuilder {
        MqClientBuilder::new()
    }

    pub(crate) fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self> {
        // ---
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                transport: OnceCell::new(),
                producers: Arc::new(ResourceRegistry::new()),
                consumers: Arc::new(ResourceRegistry::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Kind of transport this client uses.
    pub fn mode(&self) -> TransportMode {
        self.inner.connector.mode()
    }

    /// Whether the transport has been created yet.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.initialized()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Distinct physical producers currently tracked.
    pub fn active_producers(&self) -> usize {
        self.inner.producers.len()
    }

    /// Distinct physical consumers currently tracked.
    pub fn active_consumers(&self) -> usize {
        self.inner.consumers.len()
    }

    /// Get a producer for `topic`, sharing the physical producer with any
    /// other live producer for the same `(instance_id, topic)`.
    ///
    /// # Errors
    ///
    /// - [`MqError::Validation`] for empty arguments.
    /// - [`MqError::InvalidState`] after [`shutdown`](Self::shutdown).
    /// - [`MqError::TransportInit`] if the transport cannot be created.
    /// - [`MqError::ResourceCreation`] if the broker refuses the producer.
    pub async fn get_producer(&self, instance_id: &str, topic: &str) -> Result<Producer> {
        // ---
        require("instance_id", instance_id)?;
        require("topic", topic)?;

        let transport = self.transport().await?;
        let config = &self.inner.config;
        let key = ResourceKey::producer(instance_id, topic);

        let creator = transport.clone();
        let handle = self
            .inner
            .producers
            .acquire(key, || async move {
                let outcome = creator.create_producer(config, topic).await;
                settle(outcome, "create_producer", MqError::Transport).map(|(id, _)| id)
            })
            .await?;

        Ok(Producer::new(handle, transport, self.inner.producers.clone()))
    }

    /// Get a consumer for `(topic, group_id, tag_expression)`.
    ///
    /// `tag_expression` defaults to `*`. Consumers with the same key share
    /// one physical consumer, so asking twice never makes the broker see a
    /// duplicate group.
    ///
    /// # Errors
    ///
    /// Same as [`get_producer`](Self::get_producer).
    pub async fn get_consumer(
        &self,
        instance_id: &str,
        topic: &str,
        group_id: &str,
        tag_expression: Option<&str>,
    ) -> Result<Consumer> {
        // ---
        require("instance_id", instance_id)?;
        require("topic", topic)?;
        require("group_id", group_id)?;

        let tag_expression = tag_expression
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .unwrap_or(DEFAULT_TAG_EXPRESSION);

        let transport = self.transport().await?;
        let config = &self.inner.config;
        let key = ResourceKey::consumer(instance_id, topic, group_id, tag_expression);

        let creator = transport.clone();
        let handle = self
            .inner
            .consumers
            .acquire(key, || async move {
                let outcome = creator
                    .create_consumer(config, topic, group_id, tag_expression)
                    .await;
                settle(outcome, "create_consumer", MqError::Transport).map(|(id, _)| id)
            })
            .await?;

        Ok(Consumer::new(
            handle,
            group_id.to_string(),
            tag_expression.to_string(),
            transport,
            self.inner.consumers.clone(),
        ))
    }

    /// Probe the transport.
    ///
    /// A reachable but degraded transport is reported as
    /// [`HealthState::Unhealthy`], not as an error.
    ///
    /// # Errors
    ///
    /// [`MqError::TransportInit`] if the transport cannot be created or
    /// cannot be reached.
    pub async fn health_check(&self) -> Result<HealthStatus> {
        // ---
        let transport = self.transport().await?;
        let health = transport
            .health_check()
            .await
            .map_err(|err| MqError::TransportInit(err.into_reason()))?;

        let status = if health.healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        Ok(HealthStatus {
            status,
            mode: transport.mode(),
            timestamp_ms: now_ms(),
            message: health.message,
        })
    }

    /// Close the transport, if it was ever created.
    ///
    /// Idempotent. Producers and consumers still alive are not shut down
    /// individually; their later calls fail at the transport.
    ///
    /// # Errors
    ///
    /// [`MqError::Shutdown`] with the transport's message if closing fails.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(transport) = self.inner.transport.get() {
            log_info!("closing {} transport", transport.mode());
            transport
                .close()
                .await
                .map_err(|err| MqError::Shutdown(err.into_reason()))?;
        }
        Ok(())
    }

    async fn transport(&self) -> Result<TransportPtr> {
        // ---
        if self.is_shut_down() {
            return Err(MqError::InvalidState("client is shut down".into()));
        }

        let transport = self
            .inner
            .transport
            .get_or_try_init(|| async {
                log_info!("connecting {} transport", self.inner.connector.mode());
                self.inner
                    .connector
                    .connect(&self.inner.config)
                    .await
                    .map_err(|err| MqError::TransportInit(err.into_reason()))
            })
            .await?;

        Ok(transport.clone())
    }
}

impl std::fmt::Debug for MqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqClient")
            .field("config", &self.inner.config)
            .field("mode", &self.mode())
            .field("connected", &self.is_connected())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
