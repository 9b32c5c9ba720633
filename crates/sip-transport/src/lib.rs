//! SIP transport layer for the sipflow stack
//!
//! This crate defines the [`Transport`] trait consumed by the user agent core
//! and ships two implementations: an in-memory [`ChannelTransport`] pair and
//! a connected [`UdpTransport`].

pub mod error;
pub mod transport;

pub use error::{Error, Result};
pub use transport::channel::ChannelTransport;
pub use transport::udp::UdpTransport;
pub use transport::{Transport, TransportEvent, TransportProtocol, TransportState};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ChannelTransport, Error, Result, Transport, TransportEvent, TransportProtocol, TransportState,
        UdpTransport,
    };
}
