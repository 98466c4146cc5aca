// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the capability surface the client layer needs from
//! whatever actually talks to the broker: an out-of-process RPC proxy, an
//! in-process native driver, or the in-memory reference transport. It
//! intentionally avoids any reference to concrete protocols or client
//! libraries.
//!
//! Transports report failure two ways, mirroring real backends: by returning
//! `Err(_)` (the call itself failed) or by returning a [`Reply`] with
//! `success == false` (the broker answered and said no). The client layer
//! folds both into its own error taxonomy; transports never need to know
//! which [`MqError`] variant a failure ends up as.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ClientConfig, ConsumerId, MqError, ProducerId, Result};

/// Which kind of backend a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    // ---
    /// Remote stub talking to an out-of-process proxy.
    Proxy,

    /// In-process native broker driver.
    Native,

    /// In-process simulation, see [`MemoryHub`](crate::MemoryHub).
    Memory,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Proxy => "proxy",
            Self::Native => "native",
            Self::Memory => "memory",
        })
    }
}

/// Structured transport answer: `{success, message, payload}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    pub success: bool,
    pub message: String,
    pub payload: Option<T>,
}

impl<T> Reply<T> {
    /// A successful answer carrying `payload`.
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            payload: Some(payload),
        }
    }

    /// A successful answer carrying `payload` and a status message.
    pub fn ok_with_message(payload: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// A rejection with the broker's explanation.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }
}

/// Fold a transport outcome into `(payload, message)` or a client error.
///
/// `wrap` builds the per-call error from the transport's message, which is
/// passed through unchanged. A success without payload is a contract breach.
pub(crate) fn settle<T, F>(outcome: Result<Reply<T>>, operation: &str, wrap: F) -> Result<(T, String)>
where
    F: FnOnce(String) -> MqError,
{
    // ---
    let reply = match outcome {
        Ok(reply) if reply.success => reply,
        Ok(reply) => return Err(wrap(reply.message)),
        Err(err) => return Err(wrap(err.into_reason())),
    };

    match reply.payload {
        Some(payload) => Ok((payload, reply.message)),
        None => Err(MqError::ProtocolViolation(format!(
            "{operation}: success reply without payload"
        ))),
    }
}

/// Identifiers of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub receipt_handle: String,
    /// Present on transactional sends.
    pub transaction_id: Option<String>,
}

/// Answer to a transport health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHealth {
    pub healthy: bool,
    pub message: String,
}

/// Push stream of raw messages for one subscription.
///
/// Each item is the JSON text of a delivered message. The stream ends when
/// the transport shuts the consumer down or is closed.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for raw message payloads.
    pub inbox: mpsc::Receiver<String>,
}

/// Transport abstraction.
///
/// The minimal capability surface consumed by [`Producer`](crate::Producer),
/// [`Consumer`](crate::Consumer) and [`MqClient`](crate::MqClient). The core
/// never inspects transport-specific shapes; identifiers returned here are
/// opaque tokens handed back on later calls.
///
/// Implementations must ensure that:
/// - `create_*` calls with the same arguments may be rejected by the broker
///   (duplicate consumer groups); the client layer prevents issuing them.
/// - once `subscribe()` returns, messages routed to that consumer afterwards
///   are pushed to the returned inbox.
/// - none of the calls impose timeouts of their own beyond the backend's.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Backend kind, reported through health checks.
    fn mode(&self) -> TransportMode;

    /// Create a physical producer for `topic`.
    async fn create_producer(&self, config: &ClientConfig, topic: &str)
        -> Result<Reply<ProducerId>>;

    /// Create a physical consumer for `(topic, group_id, tag_expression)`.
    async fn create_consumer(
        &self,
        config: &ClientConfig,
        topic: &str,
        group_id: &str,
        tag_expression: &str,
    ) -> Result<Reply<ConsumerId>>;

    /// Send a message. `props_json` is serialized [`SerializedProperties`](crate::SerializedProperties).
    async fn send(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
    ) -> Result<Reply<SendReceipt>>;

    /// Send a message ordered relative to others with the same sharding key.
    async fn send_ordered(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        sharding_key: &str,
    ) -> Result<Reply<SendReceipt>>;

    /// Send a half message; the reply must carry a transaction id.
    async fn send_transactional(
        &self,
        producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        check_immunity_secs: u64,
    ) -> Result<Reply<SendReceipt>>;

    /// Start pushing messages for `consumer` filtered by `tag_expression`.
    async fn subscribe(
        &self,
        consumer: &ConsumerId,
        tag_expression: &str,
    ) -> Result<SubscriptionHandle>;

    /// Acknowledge a delivered message by receipt handle.
    async fn ack(&self, consumer: &ConsumerId, receipt_handle: &str) -> Result<Reply<()>>;

    /// Tear down a physical producer.
    async fn shutdown_producer(&self, producer: &ProducerId) -> Result<Reply<()>>;

    /// Tear down a physical consumer; its inboxes close.
    async fn shutdown_consumer(&self, consumer: &ConsumerId) -> Result<Reply<()>>;

    /// Side-effect-free probe. `Err` means unreachable, not unhealthy.
    async fn health_check(&self) -> Result<TransportHealth>;

    /// Release the transport connection.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; all clones share one connection.
pub type TransportPtr = Arc<dyn Transport>;

/// Creates the transport on first use.
///
/// [`MqClient`](crate::MqClient) calls [`connect`](Self::connect) lazily, once,
/// so that building a client never blocks on connectivity.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    /// Kind of transport this connector produces.
    fn mode(&self) -> TransportMode;

    /// Load or reach the backend.
    async fn connect(&self, config: &ClientConfig) -> Result<TransportPtr>;
}
