//! Transport-agnostic client for a message-queue broker.
//!
//! `mq-bridge` gives application code one API for producing and consuming
//! messages, whatever sits underneath: an out-of-process proxy, a native
//! driver, or the in-memory reference transport. It provides:
//!
//! - [`MqClient`], a facade that connects lazily and hands out handles,
//! - [`Producer`] for plain, ordered, delayed and transactional sends,
//! - [`Consumer`] with a push-based delivery loop and ordered handlers,
//! - reference-counted sharing of physical broker resources, so asking for
//!   the same consumer twice never registers a duplicate group.
//!
//! Backends implement [`Transport`] and are plugged in through a
//! [`TransportConnector`].

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod client;
mod client_builder;
mod client_config;
mod consumer;
mod domain;
mod error;
mod ids;
mod message;
mod producer;
mod properties;
mod registry;
mod transport;

pub use client::{MqClient, DEFAULT_TAG_EXPRESSION};
pub use client_builder::MqClientBuilder;
pub use client_config::{env, ClientConfig, TransportOptions};
pub use consumer::{Consumer, ConsumerState, HandlerError, HandlerResult, MessageHandler};
pub use error::{MqError, Result};
pub use ids::{ConsumerId, ProducerId};
pub use message::{AckResult, HealthState, HealthStatus, MessageData, SendResult, TransactionResult};
pub use producer::{Producer, DEFAULT_TRANS_CHECK_IMMUNITY_SECS};
pub use properties::{
    // ---
    DelayLevel,
    DelayOptions,
    MessageProperties,
    SerializedProperties,
    START_DELIVER_TIME_PROPERTY,
};
pub use registry::{ResourceHandle, ResourceKey, ResourceRegistry, ResourceState};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryConnector,
    MemoryHub,
    SentMessage,
    GROUP_EXISTS_MESSAGE,
};

// --- public re-exports
pub use domain::{
    //
    Reply,
    SendReceipt,
    SubscriptionHandle,
    Transport,
    TransportConnector,
    TransportHealth,
    TransportMode,
    TransportPtr,
};
