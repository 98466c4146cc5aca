use thiserror::Error;

/// Errors surfaced by the client abstraction layer.
///
/// Validation and lifecycle errors are raised before any transport call.
/// Transport-reported failures are wrapped with the transport's own message
/// preserved verbatim; nothing in this crate retries on the caller's behalf.
#[derive(Error, Debug)]
pub enum MqError {
    /// Bad caller input. Never reaches the transport.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The transport could not be loaded or reached on first use.
    #[error("transport initialization failed: {0}")]
    TransportInit(String),

    /// The broker rejected creation of a producer or consumer.
    #[error("failed to create resource {key}: {message}")]
    ResourceCreation { key: String, message: String },

    /// A send was rejected or the transport failed while sending.
    #[error("publish failed: {0}")]
    Publish(String),

    /// An acknowledgment was rejected (unknown or expired receipt handle, ...).
    #[error("ack failed: {0}")]
    Ack(String),

    /// The transport refused to tear down a producer or consumer.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// The transport answered with a response that breaks its contract,
    /// e.g. a successful transactional send without a transaction id.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Raw failure raised by a transport implementation.
    ///
    /// The core maps this into one of the per-call variants above before it
    /// reaches application code; transports construct it directly.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON encoding of a body or property bag failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MqError {
    // ---
    /// True for errors caused by caller input rather than the broker.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// True for failures that originated at or behind the transport.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportInit(_)
                | Self::ResourceCreation { .. }
                | Self::Publish(_)
                | Self::Ack(_)
                | Self::Shutdown(_)
                | Self::Transport(_)
        )
    }

    /// The message a transport reported, without this crate's prefix.
    ///
    /// Used when re-wrapping a raw transport error into a per-call variant so
    /// the original text survives unchanged.
    pub(crate) fn into_reason(self) -> String {
        match self {
            Self::Transport(message)
            | Self::TransportInit(message)
            | Self::Publish(message)
            | Self::Ack(message)
            | Self::Shutdown(message) => message,
            Self::ResourceCreation { message, .. } => message,
            other => other.to_string(),
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, MqError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_transport_message_survives_rewrap() {
        // ---
        let raw = MqError::Transport("consumer group exists already".into());
        let wrapped = MqError::Publish(raw.into_reason());

        assert_eq!(
            wrapped.to_string(),
            "publish failed: consumer group exists already"
        );
    }

    #[test]
    fn test_classification() {
        // ---
        assert!(MqError::Validation("topic".into()).is_validation());
        assert!(!MqError::InvalidState("closed".into()).is_transport_failure());
        assert!(MqError::Ack("expired".into()).is_transport_failure());
    }
}
