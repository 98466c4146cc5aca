//! In-memory transport implementation.
//!
//! A pure in-process implementation of the domain-level `Transport` trait,
//! used for tests, local runs, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Creating a second consumer for a `(topic, group)` that already has a
//!   live one is rejected with `"consumer group exists already"`, as a real
//!   broker does. The client's registry exists to never trigger this.
//! - Once `subscribe()` returns, every message sent to the topic afterwards
//!   whose tag matches the subscription expression is pushed to the inbox.
//!   Expressions are `*` (everything) or tags joined by `||`.
//! - Each delivery gets a fresh receipt handle. Acknowledging consumes it;
//!   unknown, foreign or already-used handles are rejected.
//! - Delay and transaction properties are recorded and passed through, but
//!   delivery is immediate and half messages are visible at once.
//!
//! ## Non-Goals
//!
//! Persistence, redelivery and broker failure modes are not emulated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::registry::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    ClientConfig,
    ConsumerId,
    MessageData,
    MqError,
    ProducerId,
    Reply,
    Result,
    SendReceipt,
    SerializedProperties,
    SubscriptionHandle,
    Transport,
    TransportConnector,
    TransportHealth,
    TransportMode,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

/// Rejection a broker gives for a duplicate consumer group.
pub const GROUP_EXISTS_MESSAGE: &str = "consumer group exists already";

/// A message accepted by a [`MemoryHub`], kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub topic: String,
    pub tag: String,
    pub body: String,
    pub properties: SerializedProperties,
    /// Set for ordered sends.
    pub sharding_key: Option<String>,
    /// Set for transactional sends.
    pub transaction_id: Option<String>,
}

/// Parsed tag expression: `*` or `a||b||c`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TagFilter {
    Any,
    OneOf(Vec<String>),
}

impl TagFilter {
    fn parse(expression: &str) -> Self {
        // ---
        let tags: Vec<String> = expression
            .split("||")
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();

        if tags.is_empty() || tags.iter().any(|tag| tag == "*") {
            Self::Any
        } else {
            Self::OneOf(tags)
        }
    }

    fn matches(&self, tag: &str) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(tags) => tags.iter().any(|t| t == tag),
        }
    }
}

struct ProducerEntry {
    owner: String,
    topic: String,
}

struct Inbox {
    filter: TagFilter,
    tx: mpsc::Sender<String>,
}

struct ConsumerEntry {
    owner: String,
    topic: String,
    group_id: String,
    inboxes: Vec<Inbox>,
}

impl ConsumerEntry {
    /// Forget inboxes whose receiving side is gone.
    fn prune_closed(&mut self) {
        self.inboxes.retain(|inbox| !inbox.tx.is_closed());
    }
}

#[derive(Default)]
struct HubState {
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    // Outstanding receipt handle -> consumer it was delivered to.
    receipts: HashMap<String, ConsumerId>,
    sent: Vec<SentMessage>,
    degraded: Option<String>,
}

/// Simulated broker shared by in-memory transports.
///
/// Transports created over the same hub see each other's producers,
/// consumers and messages, like clients of one broker. Use a fresh hub per
/// test for isolation:
///
/// ```
/// # use mq_bridge::{ClientConfig, MemoryHub};
/// # async fn example() -> mq_bridge::Result<()> {
/// let hub = MemoryHub::new();
/// let config = ClientConfig::new("mem://", "ak", "sk", "I1");
///
/// let a = mq_bridge::create_memory_transport_with_hub(&config, hub.clone()).await?;
/// let b = mq_bridge::create_memory_transport_with_hub(&config, hub.clone()).await?;
/// # let _ = (a, b);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every message accepted so far, in send order.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock_ignore_poison(&self.state).sent.clone()
    }

    pub fn producer_count(&self) -> usize {
        lock_ignore_poison(&self.state).producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        lock_ignore_poison(&self.state).consumers.len()
    }

    /// Receipt handles delivered but not yet acknowledged.
    pub fn pending_receipts(&self) -> usize {
        lock_ignore_poison(&self.state).receipts.len()
    }

    /// Make health probes report unhealthy with `reason`.
    pub fn set_degraded(&self, reason: impl Into<String>) {
        lock_ignore_poison(&self.state).degraded = Some(reason.into());
    }

    /// Undo [`set_degraded`](Self::set_degraded).
    pub fn clear_degraded(&self) {
        lock_ignore_poison(&self.state).degraded = None;
    }

    /// Push `raw` text, unparsed, to every inbox subscribed to `topic`.
    ///
    /// Bypasses tag filtering and receipt tracking; meant for feeding
    /// consumers payloads a real broker could deliver but this hub would
    /// never produce.
    pub async fn inject_raw(&self, topic: &str, raw: &str) -> usize {
        // ---
        let targets: Vec<mpsc::Sender<String>> = {
            let state = lock_ignore_poison(&self.state);
            state
                .consumers
                .values()
                .filter(|consumer| consumer.topic == topic)
                .flat_map(|consumer| consumer.inboxes.iter().map(|inbox| inbox.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(raw.to_string()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn create_producer(&self, owner: &str, topic: &str) -> Reply<ProducerId> {
        // ---
        let id = ProducerId::generate();
        let mut state = lock_ignore_poison(&self.state);
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                owner: owner.to_string(),
                topic: topic.to_string(),
            },
        );

        log_debug!("{owner}: producer {id} on {topic}");
        Reply::ok(id)
    }

    fn create_consumer(&self, owner: &str, topic: &str, group_id: &str) -> Reply<ConsumerId> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let taken = state
            .consumers
            .values()
            .any(|consumer| consumer.topic == topic && consumer.group_id == group_id);
        if taken {
            return Reply::failed(GROUP_EXISTS_MESSAGE);
        }

        let id = ConsumerId::generate();
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                owner: owner.to_string(),
                topic: topic.to_string(),
                group_id: group_id.to_string(),
                inboxes: Vec::new(),
            },
        );

        log_debug!("{owner}: consumer {id} on {topic}/{group_id}");
        Reply::ok(id)
    }

    async fn send(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        sharding_key: Option<&str>,
        transactional: bool,
    ) -> Result<Reply<SendReceipt>> {
        // ---
        let properties: SerializedProperties = match serde_json::from_str(props_json) {
            Ok(properties) => properties,
            Err(err) => return Ok(Reply::failed(err.to_string())),
        };
        let message_id = uuid::Uuid::new_v4().to_string();
        let transaction_id = transactional.then(|| uuid::Uuid::new_v4().to_string());

        let deliveries = {
            let mut state = lock_ignore_poison(&self.state);

            let topic = match state.producers.get(producer) {
                Some(entry) => entry.topic.clone(),
                None => return Ok(Reply::failed(format!("unknown producer {producer}"))),
            };

            state.sent.push(SentMessage {
                message_id: message_id.clone(),
                topic: topic.clone(),
                tag: tag.to_string(),
                body: body.to_string(),
                properties: properties.clone(),
                sharding_key: sharding_key.map(str::to_string),
                transaction_id: transaction_id.clone(),
            });

            let mut deliveries = Vec::new();
            let mut receipts = Vec::new();

            for (consumer_id, consumer) in state.consumers.iter_mut() {
                if consumer.topic != topic {
                    continue;
                }
                consumer.prune_closed();
                for inbox in consumer.inboxes.iter().filter(|i| i.filter.matches(tag)) {
                    let receipt_handle = uuid::Uuid::new_v4().to_string();
                    let message = MessageData {
                        message_id: message_id.clone(),
                        receipt_handle: receipt_handle.clone(),
                        body: body.to_string(),
                        tag: tag.to_string(),
                        properties: properties.properties.clone().into_iter().collect(),
                        born_timestamp: now_ms(),
                        reconsume_times: 0,
                    };
                    let payload = serde_json::to_string(&message)?;
                    deliveries.push((inbox.tx.clone(), payload, receipt_handle.clone()));
                    receipts.push((receipt_handle, consumer_id.clone()));
                }
            }

            // Recorded before delivery so a fast handler can ack at once.
            state.receipts.extend(receipts);
            deliveries
        };

        // Channels are fed outside the lock; a full inbox must not stall acks.
        let mut undelivered = Vec::new();
        for (tx, payload, receipt_handle) in deliveries {
            if tx.send(payload).await.is_err() {
                log_debug!("dropped delivery of {message_id} to a closed inbox");
                undelivered.push(receipt_handle);
            }
        }
        if !undelivered.is_empty() {
            let mut state = lock_ignore_poison(&self.state);
            for receipt_handle in &undelivered {
                state.receipts.remove(receipt_handle);
            }
        }

        let receipt_handle = uuid::Uuid::new_v4().to_string();
        Ok(Reply::ok(SendReceipt {
            message_id,
            receipt_handle,
            transaction_id,
        }))
    }

    fn subscribe(&self, consumer: &ConsumerId, tag_expression: &str) -> Result<SubscriptionHandle> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let entry = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| MqError::Transport(format!("unknown consumer {consumer}")))?;

        entry.prune_closed();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        entry.inboxes.push(Inbox {
            filter: TagFilter::parse(tag_expression),
            tx,
        });

        log_debug!("consumer {consumer} subscribed [{tag_expression}]");
        Ok(SubscriptionHandle { inbox: rx })
    }

    fn ack(&self, consumer: &ConsumerId, receipt_handle: &str) -> Reply<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match state.receipts.get(receipt_handle) {
            None => Reply::failed(format!("unknown receipt handle {receipt_handle}")),
            Some(owner) if owner != consumer => Reply::failed(format!(
                "receipt handle {receipt_handle} belongs to another consumer"
            )),
            Some(_) => {
                state.receipts.remove(receipt_handle);
                Reply::ok_with_message((), "acknowledged")
            }
        }
    }

    fn shutdown_producer(&self, producer: &ProducerId) -> Reply<()> {
        let mut state = lock_ignore_poison(&self.state);
        match state.producers.remove(producer) {
            Some(_) => Reply::ok(()),
            None => Reply::failed(format!("unknown producer {producer}")),
        }
    }

    fn shutdown_consumer(&self, consumer: &ConsumerId) -> Reply<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        // Dropping the entry drops its senders, which ends every inbox.
        if state.consumers.remove(consumer).is_none() {
            return Reply::failed(format!("unknown consumer {consumer}"));
        }
        state.receipts.retain(|_, owner| owner != consumer);
        Reply::ok(())
    }

    fn health(&self) -> TransportHealth {
        // ---
        let state = lock_ignore_poison(&self.state);
        match &state.degraded {
            Some(reason) => TransportHealth {
                healthy: false,
                message: reason.clone(),
            },
            None => TransportHealth {
                healthy: true,
                message: format!(
                    "{} producers, {} consumers",
                    state.producers.len(),
                    state.consumers.len()
                ),
            },
        }
    }

    // Remove everything `owner` created.
    fn close(&self, owner: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        state.producers.retain(|_, entry| entry.owner != owner);

        let HubState {
            consumers,
            receipts,
            ..
        } = &mut *state;
        consumers.retain(|_, entry| entry.owner != owner);
        receipts.retain(|_, consumer| consumers.contains_key(consumer));
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// Routes everything through a shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::Transport(format!(
                "{}: transport is closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn mode(&self) -> TransportMode {
        TransportMode::Memory
    }

    async fn create_producer(
        &self,
        _config: &ClientConfig,
        topic: &str,
    ) -> Result<Reply<ProducerId>> {
        self.ensure_open()?;
        Ok(self.hub.create_producer(&self.transport_id, topic))
    }

    async fn create_consumer(
        &self,
        _config: &ClientConfig,
        topic: &str,
        group_id: &str,
        _tag_expression: &str,
    ) -> Result<Reply<ConsumerId>> {
        self.ensure_open()?;
        Ok(self.hub.create_consumer(&self.transport_id, topic, group_id))
    }

    async fn send(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
    ) -> Result<Reply<SendReceipt>> {
        self.ensure_open()?;
        self.hub
            .send(producer, body, tag, props_json, None, false)
            .await
    }

    async fn send_ordered(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        sharding_key: &str,
    ) -> Result<Reply<SendReceipt>> {
        self.ensure_open()?;
        self.hub
            .send(producer, body, tag, props_json, Some(sharding_key), false)
            .await
    }

    async fn send_transactional(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        _check_immunity_secs: u64,
    ) -> Result<Reply<SendReceipt>> {
        self.ensure_open()?;
        self.hub
            .send(producer, body, tag, props_json, None, true)
            .await
    }

    /// Once this returns, later sends to the consumer's topic whose tag
    /// matches `tag_expression` are pushed to the returned inbox.
    async fn subscribe(
        &self,
        consumer: &ConsumerId,
        tag_expression: &str,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        self.hub.subscribe(consumer, tag_expression)
    }

    async fn ack(&self, consumer: &ConsumerId, receipt_handle: &str) -> Result<Reply<()>> {
        self.ensure_open()?;
        Ok(self.hub.ack(consumer, receipt_handle))
    }

    async fn shutdown_producer(&self, producer: &ProducerId) -> Result<Reply<()>> {
        self.ensure_open()?;
        Ok(self.hub.shutdown_producer(producer))
    }

    async fn shutdown_consumer(&self, consumer: &ConsumerId) -> Result<Reply<()>> {
        self.ensure_open()?;
        Ok(self.hub.shutdown_consumer(consumer))
    }

    async fn health_check(&self) -> Result<TransportHealth> {
        self.ensure_open()?;
        Ok(self.hub.health())
    }

    /// Close the transport and drop every resource it created on the hub.
    ///
    /// Resources created by other transports on the same hub are untouched.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) {
            log_debug!("{}: closing transport", self.transport_id);
            self.hub.close(&self.transport_id);
        }
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: &ClientConfig) -> Result<TransportPtr> {
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: &ClientConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    let transport_id = format!("{}-{}", config.instance_id, uuid::Uuid::new_v4().simple());
    log_info!("{transport_id}: memory transport ready");

    Ok(Arc::new(MemoryTransport {
        transport_id,
        hub,
        closed: AtomicBool::new(false),
    }))
}

/// [`TransportConnector`] producing in-memory transports.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

impl MemoryConnector {
    /// Connector bound to the process-global hub.
    pub fn new() -> Self {
        Self { hub: global_hub() }
    }

    pub fn with_hub(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransportConnector for MemoryConnector {
    fn mode(&self) -> TransportMode {
        TransportMode::Memory
    }

    async fn connect(&self, config: &ClientConfig) -> Result<TransportPtr> {
        create_memory_transport_with_hub(config, self.hub.clone()).await
    }
}
