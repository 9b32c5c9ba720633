//! Dialog and user agent errors

use thiserror::Error;

use sipflow_sip_core::StatusCode;

use super::transaction_errors::TransactionError;
use crate::dialog::DialogId;

/// Result type for dialog and user agent operations
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors that can occur above the transaction layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DialogError {
    /// SIP protocol violation
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation refused in the current dialog or user agent state
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// No dialog, client or server matches the given identifier
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Out-of-order in-dialog request (answered 500)
    #[error("CSeq {received} is not above remote CSeq {current} in dialog {dialog}")]
    OutOfOrder {
        dialog: DialogId,
        received: u32,
        current: u32,
    },

    /// An offer was refused because another one is outstanding
    #[error("offer refused with {status}: {message}")]
    OfferConflict { status: StatusCode, message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("message error: {0}")]
    Message(#[from] sipflow_sip_core::Error),

    /// The user agent runner has stopped
    #[error("user agent is not running")]
    Shutdown,
}

impl DialogError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        DialogError::Protocol { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        DialogError::InvalidState { message: message.into() }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DialogError::NotFound { kind, id: id.to_string() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        DialogError::Configuration { message: message.into() }
    }

    /// Whether this is a refused state transition at either layer
    pub fn is_state_error(&self) -> bool {
        match self {
            DialogError::InvalidState { .. } => true,
            DialogError::Transaction(e) => e.is_state_error(),
            _ => false,
        }
    }
}

impl From<sipflow_sip_transport::Error> for DialogError {
    fn from(error: sipflow_sip_transport::Error) -> Self {
        DialogError::Transport { message: error.to_string() }
    }
}
