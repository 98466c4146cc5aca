//! Logical producer handle.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::domain::settle;
use crate::registry::{lock_ignore_poison, ResourceHandle, ResourceRegistry};
use crate::{
    // ---
    log_debug,
    log_warn,
    DelayLevel,
    DelayOptions,
    MessageProperties,
    MqError,
    ProducerId,
    Result,
    SendReceipt,
    SendResult,
    TransactionResult,
    TransportPtr,
};

/// Check-immunity window applied by
/// [`Producer::publish_transactional_default`], in seconds.
pub const DEFAULT_TRANS_CHECK_IMMUNITY_SECS: u64 = 5;

/// Sends messages to one topic.
///
/// Obtained from [`MqClient::get_producer`](crate::MqClient::get_producer).
/// Producers for the same `(instance_id, topic)` share one physical broker
/// producer; [`shutdown`](Self::shutdown) detaches this handle and the last
/// one out tears the physical producer down.
///
/// Sends are not retried and carry no timeout of their own: a transport
/// failure is returned to the caller with the transport's message intact.
///
/// Dropping a producer without calling [`shutdown`](Self::shutdown) keeps
/// its reference alive in the client, so the physical producer is never torn
/// down. A warning is logged when that happens.
pub struct Producer {
    topic: String,
    producer_id: ProducerId,
    transport: TransportPtr,
    registry: Arc<ResourceRegistry<ProducerId>>,
    handle: Mutex<Option<ResourceHandle<ProducerId>>>,
}

/// Wire text of a message body.
///
/// Strings travel as-is; everything else is JSON-encoded, so `{a: 1}`
/// becomes `{"a":1}` and `42` becomes `42`.
pub(crate) fn encode_body<B>(body: &B) -> Result<String>
where
    B: Serialize + ?Sized,
{
    match serde_json::to_value(body)? {
        Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

impl Producer {
    pub(crate) fn new(
        handle: ResourceHandle<ProducerId>,
        transport: TransportPtr,
        registry: Arc<ResourceRegistry<ProducerId>>,
    ) -> Self {
        // ---
        Self {
            topic: handle.key().topic().to_string(),
            producer_id: handle.resource().clone(),
            transport,
            registry,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Transport identifier of the shared physical producer.
    pub fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    /// Live references to the shared physical producer; `0` once shut down.
    pub fn ref_count(&self) -> usize {
        lock_ignore_poison(&self.handle)
            .as_ref()
            .map_or(0, ResourceHandle::ref_count)
    }

    pub fn is_shut_down(&self) -> bool {
        lock_ignore_poison(&self.handle).is_none()
    }

    /// Send a message.
    ///
    /// # Errors
    ///
    /// - [`MqError::InvalidState`] after [`shutdown`](Self::shutdown).
    /// - [`MqError::Serialization`] if `body` cannot be encoded.
    /// - [`MqError::Publish`] if the transport fails or rejects the send.
    pub async fn publish<B>(
        &self,
        body: &B,
        tag: &str,
        properties: MessageProperties,
    ) -> Result<SendResult>
    where
        B: Serialize + ?Sized,
    {
        // ---
        self.ensure_live("publish")?;
        let body = encode_body(body)?;
        let props_json = properties.to_json()?;

        let outcome = self
            .transport
            .send(&self.producer_id, &body, tag, &props_json)
            .await;
        let (receipt, _) = settle(outcome, "send", MqError::Publish)?;

        log_debug!("{}: sent {}", self.topic, receipt.message_id);
        Ok(send_result(receipt))
    }

    /// Send a message ordered relative to others with the same sharding key.
    ///
    /// An empty `sharding_key` is passed through unchanged; ordering is then
    /// up to the broker.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn publish_ordered<B>(
        &self,
        body: &B,
        tag: &str,
        properties: MessageProperties,
        sharding_key: &str,
    ) -> Result<SendResult>
    where
        B: Serialize + ?Sized,
    {
        // ---
        self.ensure_live("publish_ordered")?;
        let body = encode_body(body)?;
        let props_json = properties.with_sharding_key(sharding_key).to_json()?;

        let outcome = self
            .transport
            .send_ordered(&self.producer_id, &body, tag, &props_json, sharding_key)
            .await;
        let (receipt, _) = settle(outcome, "send_ordered", MqError::Publish)?;

        log_debug!(
            "{}: sent ordered {} (shard {sharding_key:?})",
            self.topic,
            receipt.message_id
        );
        Ok(send_result(receipt))
    }

    /// Send a message whose delivery is postponed.
    ///
    /// The delay is carried entirely in the message properties and goes out
    /// through the same call as [`publish`](Self::publish). When both a start
    /// time and a level are given, the start time wins.
    ///
    /// # Errors
    ///
    /// [`MqError::Validation`] for a level outside `1..=18`; otherwise the
    /// same as [`publish`](Self::publish).
    pub async fn publish_delayed<B>(
        &self,
        body: &B,
        tag: &str,
        properties: MessageProperties,
        delay: DelayOptions,
    ) -> Result<SendResult>
    where
        B: Serialize + ?Sized,
    {
        // ---
        let mut properties = properties;

        if let Some(level) = delay.delay_time_level {
            let level = DelayLevel::new(level)?;
            properties = properties.with_delay_time_level(level.level());
        }
        if let Some(at) = delay.start_deliver_time {
            properties = properties.with_start_deliver_time(at);
        }

        self.publish(body, tag, properties).await
    }

    /// Send a half message for a local transaction.
    ///
    /// # Errors
    ///
    /// [`MqError::ProtocolViolation`] if the transport accepts the send but
    /// returns no transaction id; otherwise the same as
    /// [`publish`](Self::publish).
    pub async fn publish_transactional<B>(
        &self,
        body: &B,
        tag: &str,
        properties: MessageProperties,
        trans_check_immunity_secs: u64,
    ) -> Result<TransactionResult>
    where
        B: Serialize + ?Sized,
    {
        // ---
        self.ensure_live("publish_transactional")?;
        let body = encode_body(body)?;
        let props_json = properties
            .with_trans_check_immunity_time(trans_check_immunity_secs)
            .to_json()?;

        let outcome = self
            .transport
            .send_transactional(
                &self.producer_id,
                &body,
                tag,
                &props_json,
                trans_check_immunity_secs,
            )
            .await;
        let (receipt, _) = settle(outcome, "send_transactional", MqError::Publish)?;

        let transaction_id = match receipt.transaction_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(MqError::ProtocolViolation(format!(
                    "transactional send of {} returned no transaction id",
                    receipt.message_id
                )))
            }
        };

        log_debug!(
            "{}: sent half message {} (txn {transaction_id})",
            self.topic,
            receipt.message_id
        );
        Ok(TransactionResult {
            message_id: receipt.message_id,
            receipt_handle: receipt.receipt_handle,
            transaction_id,
        })
    }

    /// [`publish_transactional`](Self::publish_transactional) with
    /// [`DEFAULT_TRANS_CHECK_IMMUNITY_SECS`].
    pub async fn publish_transactional_default<B>(
        &self,
        body: &B,
        tag: &str,
        properties: MessageProperties,
    ) -> Result<TransactionResult>
    where
        B: Serialize + ?Sized,
    {
        self.publish_transactional(body, tag, properties, DEFAULT_TRANS_CHECK_IMMUNITY_SECS)
            .await
    }

    /// Detach from the shared physical producer.
    ///
    /// Idempotent. The physical producer is shut down when the last handle
    /// detaches.
    ///
    /// # Errors
    ///
    /// [`MqError::Shutdown`] if the transport refuses the teardown. The
    /// handle is detached regardless.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let handle = lock_ignore_poison(&self.handle).take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let transport = self.transport.clone();
        self.registry
            .release(handle, |producer| async move {
                let outcome = transport.shutdown_producer(&producer).await;
                settle(outcome, "shutdown_producer", MqError::Shutdown).map(|_| ())
            })
            .await
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(MqError::InvalidState(format!(
                "{operation} on producer for {} after shutdown",
                self.topic
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("producer_id", &self.producer_id)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

fn send_result(receipt: SendReceipt) -> SendResult {
    SendResult {
        message_id: receipt.message_id,
        receipt_handle: receipt.receipt_handle,
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if lock_ignore_poison(&self.handle).is_some() {
            log_warn!(
                "producer for {} dropped without shutdown; its broker producer stays open",
                self.topic
            );
        }
    }
}
