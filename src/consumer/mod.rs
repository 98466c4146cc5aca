//! Logical consumer handle and its delivery loop.
//!
//! A [`Consumer`] walks a one-way lifecycle:
//!
//! ```text
//! Created -> Subscribed -> Receiving -> ShuttingDown -> Closed
//! ```
//!
//! `Subscribed` is reached by registering the first handler, `Receiving` by
//! [`Consumer::start_receiving`]. Acknowledgments are only accepted while
//! `Receiving`.

mod handler;

pub use handler::{HandlerError, HandlerResult, MessageHandler};

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::settle;
use crate::registry::{lock_ignore_poison, ResourceHandle, ResourceRegistry};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckResult,
    ConsumerId,
    MessageData,
    MqError,
    Result,
    TransportPtr,
};

/// Lifecycle state of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribed,
    Receiving,
    ShuttingDown,
    Closed,
}

/// Registered handlers, in registration order.
type HandlerList = Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>;

struct Delivery {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Receives messages for one `(topic, group, tag expression)`.
///
/// Obtained from [`MqClient::get_consumer`](crate::MqClient::get_consumer).
/// Consumers with the same key share one physical broker consumer.
///
/// Always end with [`shutdown`](Self::shutdown). A consumer dropped without
/// it stops its own delivery loop, but its reference stays counted and the
/// physical consumer is never torn down.
pub struct Consumer {
    topic: String,
    group_id: String,
    tag_expression: String,
    consumer_id: ConsumerId,
    transport: TransportPtr,
    registry: Arc<ResourceRegistry<ConsumerId>>,
    handle: Mutex<Option<ResourceHandle<ConsumerId>>>,
    state: Mutex<ConsumerState>,
    handlers: HandlerList,

    // Held across start_receiving and shutdown so they never interleave.
    delivery: tokio::sync::Mutex<Option<Delivery>>,
}

fn read_handlers(handlers: &HandlerList) -> RwLockReadGuard<'_, Vec<Arc<dyn MessageHandler>>> {
    match handlers.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_handlers(handlers: &HandlerList) -> RwLockWriteGuard<'_, Vec<Arc<dyn MessageHandler>>> {
    match handlers.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Consumer {
    pub(crate) fn new(
        handle: ResourceHandle<ConsumerId>,
        group_id: String,
        tag_expression: String,
        transport: TransportPtr,
        registry: Arc<ResourceRegistry<ConsumerId>>,
    ) -> Self {
        // ---
        Self {
            topic: handle.key().topic().to_string(),
            group_id,
            tag_expression,
            consumer_id: handle.resource().clone(),
            transport,
            registry,
            handle: Mutex::new(Some(handle)),
            state: Mutex::new(ConsumerState::Created),
            handlers: Arc::new(RwLock::new(Vec::new())),
            delivery: tokio::sync::Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn tag_expression(&self) -> &str {
        &self.tag_expression
    }

    /// Transport identifier of the shared physical consumer.
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    pub fn state(&self) -> ConsumerState {
        *lock_ignore_poison(&self.state)
    }

    /// Live references to the shared physical consumer; `0` once shut down.
    pub fn ref_count(&self) -> usize {
        lock_ignore_poison(&self.handle)
            .as_ref()
            .map_or(0, ResourceHandle::ref_count)
    }

    pub fn handler_count(&self) -> usize {
        read_handlers(&self.handlers).len()
    }

    /// Register a handler.
    ///
    /// Every delivered message goes to all handlers, one after another in
    /// registration order. Handlers added while receiving take effect from
    /// the next message.
    ///
    /// # Errors
    ///
    /// [`MqError::InvalidState`] once shutdown has begun.
    pub fn on_message<H>(&self, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match *state {
            ConsumerState::ShuttingDown | ConsumerState::Closed => {
                return Err(MqError::InvalidState(format!(
                    "on_message on consumer {} in state {:?}",
                    self.label(),
                    *state
                )));
            }
            ConsumerState::Created => *state = ConsumerState::Subscribed,
            ConsumerState::Subscribed | ConsumerState::Receiving => {}
        }

        write_handlers(&self.handlers).push(Arc::new(handler));
        Ok(())
    }

    /// Subscribe and start the delivery loop.
    ///
    /// `tag_expression` overrides the one the consumer was created with.
    /// Messages that fail to parse are logged and dropped; they are neither
    /// delivered nor acknowledged, so the broker redelivers them later.
    ///
    /// # Errors
    ///
    /// - [`MqError::InvalidState`] if already receiving or shut down.
    /// - [`MqError::ResourceCreation`] carrying the transport's message if the
    ///   subscription fails; the consumer then stays in its previous state and
    ///   the call may be repeated.
    pub async fn start_receiving(&self, tag_expression: Option<&str>) -> Result<()> {
        // ---
        let mut delivery = self.delivery.lock().await;

        let state = self.state();
        if !matches!(state, ConsumerState::Created | ConsumerState::Subscribed) {
            return Err(MqError::InvalidState(format!(
                "start_receiving on consumer {} in state {state:?}",
                self.label()
            )));
        }

        if self.handler_count() == 0 {
            log_warn!(
                "{}: receiving with no handlers; messages will be dropped",
                self.label()
            );
        }

        let tag = tag_expression
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or(self.tag_expression.as_str());

        let subscription = self
            .transport
            .subscribe(&self.consumer_id, tag)
            .await
            .map_err(|err| MqError::ResourceCreation {
                key: self.resource_key(),
                message: err.into_reason(),
            })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = spawn_delivery(
            self.label(),
            subscription.inbox,
            self.handlers.clone(),
            shutdown_rx,
        );
        *delivery = Some(Delivery { shutdown_tx, task });

        *lock_ignore_poison(&self.state) = ConsumerState::Receiving;
        log_info!("{}: receiving [{tag}]", self.label());
        Ok(())
    }

    /// Acknowledge a delivered message.
    ///
    /// # Errors
    ///
    /// - [`MqError::InvalidState`] unless the consumer is receiving.
    /// - [`MqError::Validation`] for an empty receipt handle.
    /// - [`MqError::Ack`] if the transport rejects the acknowledgment.
    pub async fn ack_message(&self, receipt_handle: &str) -> Result<AckResult> {
        // ---
        let state = self.state();
        if state != ConsumerState::Receiving {
            return Err(MqError::InvalidState(format!(
                "ack_message on consumer {} in state {state:?}",
                self.label()
            )));
        }

        if receipt_handle.trim().is_empty() {
            return Err(MqError::Validation("receipt handle is empty".into()));
        }

        let outcome = self.transport.ack(&self.consumer_id, receipt_handle).await;
        let ((), message) = settle(outcome, "ack", MqError::Ack)?;

        Ok(AckResult { message })
    }

    /// Stop delivery and detach from the shared physical consumer.
    ///
    /// The delivery loop is stopped and awaited first, so no handler runs
    /// after the reference is dropped. A message already being dispatched
    /// finishes first. Idempotent. Must not be awaited from inside one of
    /// this consumer's own handlers.
    ///
    /// # Errors
    ///
    /// [`MqError::Shutdown`] if the transport refuses the teardown. The
    /// consumer is closed regardless.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let mut delivery = self.delivery.lock().await;

        if self.state() == ConsumerState::Closed {
            return Ok(());
        }
        *lock_ignore_poison(&self.state) = ConsumerState::ShuttingDown;

        if let Some(Delivery { shutdown_tx, task }) = delivery.take() {
            let _ = shutdown_tx.send(());
            if let Err(_err) = task.await {
                log_error!("{}: delivery loop ended abnormally: {_err}", self.label());
            }
        }

        let handle = lock_ignore_poison(&self.handle).take();
        let result = match handle {
            Some(handle) => {
                let transport = self.transport.clone();
                self.registry
                    .release(handle, |consumer| async move {
                        let outcome = transport.shutdown_consumer(&consumer).await;
                        settle(outcome, "shutdown_consumer", MqError::Shutdown).map(|_| ())
                    })
                    .await
            }
            None => Ok(()),
        };

        *lock_ignore_poison(&self.state) = ConsumerState::Closed;
        log_debug!("{}: closed", self.label());
        result
    }

    fn label(&self) -> String {
        format!("{}/{}", self.topic, self.group_id)
    }

    fn resource_key(&self) -> String {
        lock_ignore_poison(&self.handle)
            .as_ref()
            .map(|handle| handle.key().to_string())
            .unwrap_or_else(|| self.label())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // ---
        if let Ok(mut delivery) = self.delivery.try_lock() {
            if let Some(Delivery { task, .. }) = delivery.take() {
                task.abort();
            }
        }

        if lock_ignore_poison(&self.handle).is_some() {
            log_warn!(
                "{}: consumer dropped without shutdown; its broker consumer stays open",
                self.label()
            );
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("tag_expression", &self.tag_expression)
            .field("consumer_id", &self.consumer_id)
            .field("state", &self.state())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

// Runs until shutdown is signalled, the sender is dropped, or the
// transport closes the inbox.
fn spawn_delivery(
    label: String,
    mut inbox: mpsc::Receiver<String>,
    handlers: HandlerList,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log_debug!("{label}: delivery loop started");

        loop {
            let raw = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                raw = inbox.recv() => match raw {
                    Some(raw) => raw,
                    None => {
                        log_debug!("{label}: inbox closed by transport");
                        break;
                    }
                },
            };

            let message = match serde_json::from_str::<MessageData>(&raw) {
                Ok(message) => message,
                Err(err) => {
                    log_warn!("{label}: dropping malformed message: {err}");
                    continue;
                }
            };

            dispatch(&label, &handlers, message).await;
        }

        log_debug!("{label}: delivery loop stopped");
    })
}

// Each handler runs in its own task so a panic is contained like an error.
async fn dispatch(label: &str, handlers: &HandlerList, message: MessageData) {
    // ---
    let snapshot: Vec<Arc<dyn MessageHandler>> = read_handlers(handlers).clone();

    for (index, handler) in snapshot.into_iter().enumerate() {
        let copy = message.clone();
        let outcome = tokio::spawn(async move { handler.handle(copy).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_error!(
                "{label}: handler #{index} failed on {}: {err}",
                message.message_id
            ),
            Err(err) => log_error!(
                "{label}: handler #{index} panicked on {}: {err}",
                message.message_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message() -> MessageData {
        serde_json::from_str(r#"{"messageId":"m1","receiptHandle":"r1","body":"hi"}"#).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_survives_failing_and_panicking_handlers() {
        // ---
        let seen = Arc::new(AtomicUsize::new(0));
        let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));

        write_handlers(&handlers).push(Arc::new(|_msg: MessageData| async move {
            Err::<(), HandlerError>("boom".into())
        }));
        write_handlers(&handlers).push(Arc::new(|msg: MessageData| async move {
            if msg.receipt_handle == "r1" {
                panic!("handler panic");
            }
            Ok::<(), HandlerError>(())
        }));
        let counter = seen.clone();
        write_handlers(&handlers).push(Arc::new(move |msg: MessageData| {
            let counter = counter.clone();
            async move {
                assert_eq!(msg.body, "hi");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }));

        dispatch("t/g", &handlers, message()).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delivery_loop_drops_malformed_and_stops_on_signal() {
        // ---
        let seen = Arc::new(AtomicUsize::new(0));
        let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));
        let counter = seen.clone();
        write_handlers(&handlers).push(Arc::new(move |_msg: MessageData| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }));

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = spawn_delivery("t/g".into(), rx, handlers, shutdown_rx);

        tx.send("not json".to_string()).await.unwrap();
        tx.send(serde_json::to_string(&message()).unwrap()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
