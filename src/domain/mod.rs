//! Domain layer public interface.
//!
//! This module defines the transport capability surface, independent of any
//! concrete backend.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub(crate) use transport::settle;

pub use transport::{
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
