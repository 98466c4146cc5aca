//! Values exchanged with application code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::TransportMode;

/// Outcome of a successful send, returned verbatim from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub message_id: String,
    pub receipt_handle: String,
}

/// Outcome of a successful transactional send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub message_id: String,
    pub receipt_handle: String,
    pub transaction_id: String,
}

/// Confirmation of an accepted acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    /// Transport message accompanying the acceptance.
    pub message: String,
}

/// A message delivered to consumer handlers.
///
/// Parsed from the raw JSON a transport pushes. Each handler receives its own
/// copy; nothing in it refers back to transport buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Producer-side creation time, epoch milliseconds.
    #[serde(default)]
    pub born_timestamp: i64,

    /// How many times the broker has redelivered this message.
    #[serde(default)]
    pub reconsume_times: u32,
}

impl MessageData {
    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Whether the transport answered the health probe as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Result of [`MqClient::health_check`](crate::MqClient::health_check).
///
/// An unhealthy but reachable transport is reported here, not as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: HealthState,
    pub mode: TransportMode,
    /// Probe time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Detail reported by the transport.
    pub message: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}
