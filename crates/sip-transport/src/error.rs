use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::transport::TransportState;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by SIP transports
#[derive(Error, Debug)]
pub enum Error {
    /// The transport or its peer has gone away
    #[error("Transport is closed")]
    TransportClosed,

    /// `send` was called while not connected
    #[error("Transport is not connected (state: {0})")]
    NotConnected(TransportState),

    /// Binding the local socket failed
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, #[source] io::Error),

    /// Connecting to the remote peer failed
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] io::Error),

    /// A datagram exceeded the maximum size
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Sending failed for another reason
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Underlying I/O error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
