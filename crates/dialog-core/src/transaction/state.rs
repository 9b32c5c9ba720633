//! Transaction kinds and states (RFC 3261 §17, RFC 6026 §7)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{TransactionError, TransactionResult};

/// The four transaction state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// INVITE client transaction (ICT)
    InviteClient,
    /// INVITE server transaction (IST)
    InviteServer,
    /// Non-INVITE client transaction (NICT)
    NonInviteClient,
    /// Non-INVITE server transaction (NIST)
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_server(&self) -> bool {
        matches!(self, TransactionKind::InviteServer | TransactionKind::NonInviteServer)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::InviteServer)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionKind::InviteClient => "ICT",
            TransactionKind::InviteServer => "IST",
            TransactionKind::NonInviteClient => "NICT",
            TransactionKind::NonInviteServer => "NIST",
        })
    }
}

/// Transaction states.
///
/// Not every state applies to every kind:
///
/// | State      | ICT | IST | NICT | NIST |
/// |------------|-----|-----|------|------|
/// | Initial    |  x  |     |  x   |      |
/// | Calling    |  x  |     |      |      |
/// | Trying     |     |     |  x   |  x   |
/// | Proceeding |  x  |  x  |  x   |  x   |
/// | Accepted   |  x  |  x  |      |      |
/// | Completed  |  x  |  x  |  x   |  x   |
/// | Confirmed  |     |  x  |      |      |
/// | Terminated |  x  |  x  |  x   |  x   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Created, request not sent yet
    Initial,
    /// ICT: INVITE sent, no response yet
    Calling,
    /// Non-INVITE: request sent or received, no response yet
    Trying,
    /// A provisional response was sent or received
    Proceeding,
    /// INVITE: a 2xx was sent or received (RFC 6026)
    Accepted,
    /// A final non-2xx (or any non-INVITE final) response was sent or received
    Completed,
    /// IST: ACK received for a non-2xx final response
    Confirmed,
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }

    /// Checks that moving from `current` to `new` is defined for `kind`.
    ///
    /// Staying in the same state is allowed, and every live state may move
    /// to Terminated. Nothing leaves Terminated.
    pub fn validate_transition(
        kind: TransactionKind,
        current: TransactionState,
        new: TransactionState,
    ) -> TransactionResult<()> {
        use TransactionState::*;

        let allowed = match (current, new) {
            (Terminated, _) => false,
            (a, b) if a == b => true,
            (_, Terminated) => true,
            _ => match kind {
                TransactionKind::InviteClient => matches!(
                    (current, new),
                    (Initial, Calling)
                        | (Calling, Proceeding | Accepted | Completed)
                        | (Proceeding, Accepted | Completed)
                ),
                TransactionKind::InviteServer => matches!(
                    (current, new),
                    (Proceeding, Accepted | Completed) | (Completed, Confirmed)
                ),
                TransactionKind::NonInviteClient => matches!(
                    (current, new),
                    (Initial, Trying) | (Trying, Proceeding | Completed) | (Proceeding, Completed)
                ),
                TransactionKind::NonInviteServer => matches!(
                    (current, new),
                    (Trying, Proceeding | Completed) | (Proceeding, Completed)
                ),
            },
        };

        if allowed {
            Ok(())
        } else {
            Err(TransactionError::InvalidStateTransition {
                kind,
                from: current,
                to: new,
            })
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
