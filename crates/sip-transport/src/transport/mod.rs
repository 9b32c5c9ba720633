//! Transport abstraction.
//!
//! A transport is a connected, byte-oriented channel to one peer. Framing and
//! parsing are the caller's business: incoming data is handed out unparsed as
//! [`TransportEvent::MessageReceived`] on the channel returned when the
//! transport is created.

pub mod channel;
pub mod udp;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    /// In-process channel
    Memory,
}

impl TransportProtocol {
    /// Token used in the Via sent-protocol
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Memory => "UDP",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Memory => f.write_str("MEMORY"),
            other => f.write_str(other.via_token()),
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Connecting => "Connecting",
            TransportState::Connected => "Connected",
            TransportState::Disconnecting => "Disconnecting",
            TransportState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Events emitted by transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes of one received message
    MessageReceived(Bytes),
    /// The transport moved to a new state
    StateChanged(TransportState),
    /// A non-fatal receive error
    Error { error: String },
}

/// A connected SIP transport
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn protocol(&self) -> TransportProtocol;

    /// Reliable transports disable retransmission timers
    fn is_reliable(&self) -> bool;

    fn state(&self) -> TransportState;

    /// Establishes the connection; a no-op when already connected
    async fn connect(&self) -> Result<()>;

    /// Tears the connection down; a no-op when already disconnected
    async fn disconnect(&self) -> Result<()>;

    /// Sends one serialized message
    async fn send(&self, data: Bytes) -> Result<()>;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}
