//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait. Broker
//! drivers and proxy stubs live outside this crate and plug in through
//! [`TransportConnector`](crate::TransportConnector); the in-memory transport
//! ships here as the reference implementation.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

pub use memory::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryConnector,
    MemoryHub,
    SentMessage,
    GROUP_EXISTS_MESSAGE,
};
