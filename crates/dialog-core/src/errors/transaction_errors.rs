//! Errors raised by the transaction state machines

use thiserror::Error;

use sipflow_sip_core::{Method, StatusCode};

use crate::transaction::{TransactionKey, TransactionKind, TransactionState};

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur in transaction operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The requested transition is not defined for the current state.
    /// The transaction is left untouched.
    #[error("invalid {kind} transition from {from} to {to}")]
    InvalidStateTransition {
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    },

    /// The operation does not apply in the current state
    #[error("{operation} not allowed on {kind} in state {state}")]
    InvalidState {
        kind: TransactionKind,
        state: TransactionState,
        operation: &'static str,
    },

    /// A response whose class the operation does not permit
    #[error("status {status} not permitted: {reason}")]
    InvalidStatus { status: StatusCode, reason: &'static str },

    /// The message does not belong to this kind of transaction
    #[error("method {method} does not belong to a {kind}")]
    WrongMethod { kind: TransactionKind, method: Method },

    /// The request carries no usable branch
    #[error("request has no top Via branch")]
    MissingBranch,

    #[error("transaction not found: {0}")]
    NotFound(TransactionKey),
}

impl TransactionError {
    /// Whether this is a refused state transition
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            TransactionError::InvalidStateTransition { .. } | TransactionError::InvalidState { .. }
        )
    }
}
