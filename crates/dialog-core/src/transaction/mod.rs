//! # SIP transactions (RFC 3261 §17, RFC 6026)
//!
//! Four synchronous state machines, one per transaction kind:
//!
//! | Kind | Type | States |
//! |------|------|--------|
//! | ICT  | [`InviteClientTransaction`] | Calling, Proceeding, Accepted, Completed, Terminated |
//! | IST  | [`InviteServerTransaction`] | Proceeding, Accepted, Completed, Confirmed, Terminated |
//! | NICT | [`NonInviteClientTransaction`] | Trying, Proceeding, Completed, Terminated |
//! | NIST | [`NonInviteServerTransaction`] | Trying, Proceeding, Completed, Terminated |
//!
//! Each machine owns its request and only timer tokens. Inputs are
//! messages, timer expiries and transport failures; outputs are
//! [`TransactionEvent`]s for the transaction user plus whatever was pushed
//! through the [`TransactionIo`]. A refused input returns
//! [`TransactionError::InvalidStateTransition`] (or `InvalidState`) and
//! leaves the machine exactly as it was.

pub mod client;
pub mod io;
pub mod key;
pub mod server;
pub mod state;
pub mod timer;
pub mod utils;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use sipflow_sip_core::{Request, Response};

use crate::errors::TransactionResult;

pub use client::{ClientTransaction, InviteClientTransaction, NonInviteClientTransaction};
pub use io::{IoContext, Outgoing, TransactionIo};
pub use key::{TransactionId, TransactionKey};
pub use server::{InviteServerTransaction, NonInviteServerTransaction, ServerTransaction};
pub use state::{TransactionKind, TransactionState};
pub use timer::{TimerSettings, TimerTarget, TimerToken, TimerType};

/// What a transaction reports to its transaction user
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// Client: a response to hand to the TU
    Response(Response),
    /// IST in Accepted: an ACK for the 2xx, for the dialog layer
    AckReceived(Request),
    /// Timer B, F or H expired, or a NICT received 408
    Timeout,
    /// The transport refused a message from this transaction
    TransportError,
}

/// Behaviour common to all four state machines
pub trait Transaction {
    fn key(&self) -> &TransactionKey;

    fn kind(&self) -> TransactionKind;

    fn state(&self) -> TransactionState;

    /// The request that created the transaction
    fn request(&self) -> &Request;

    fn on_timer(&mut self, timer: TimerType, io: &mut dyn TransactionIo) -> TransactionResult<Vec<TransactionEvent>>;

    /// Terminal transport failure; nothing is retried
    fn on_transport_error(&mut self, io: &mut dyn TransactionIo) -> Vec<TransactionEvent>;

    /// Cancels every pending timer and moves to Terminated
    fn dispose(&mut self, io: &mut dyn TransactionIo);

    fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }
}

/// Validates and applies a state change
pub(crate) fn transition(
    kind: TransactionKind,
    key: &TransactionKey,
    state: &mut TransactionState,
    new: TransactionState,
) -> TransactionResult<()> {
    TransactionState::validate_transition(kind, *state, new)?;
    if *state != new {
        debug!(id = %key, "{} state {} -> {}", kind, state, new);
        *state = new;
    }
    Ok(())
}

/// Tokens of the timers a transaction has running
#[derive(Debug, Default)]
pub(crate) struct TransactionTimers {
    tokens: HashMap<TimerType, TimerToken>,
}

impl TransactionTimers {
    /// Starts (or restarts) `timer`
    pub(crate) fn start(&mut self, io: &mut dyn TransactionIo, key: &TransactionKey, timer: TimerType, after: Duration) {
        self.stop(io, timer);
        trace!(id = %key, "Starting Timer {} ({:?})", timer, after);
        let token = io.start_timer(TimerTarget::Transaction(key.clone(), timer), after);
        self.tokens.insert(timer, token);
    }

    pub(crate) fn stop(&mut self, io: &mut dyn TransactionIo, timer: TimerType) {
        if let Some(token) = self.tokens.remove(&timer) {
            io.cancel_timer(token);
        }
    }

    /// Forgets a timer that has just fired
    pub(crate) fn fired(&mut self, timer: TimerType) {
        self.tokens.remove(&timer);
    }

    pub(crate) fn stop_all(&mut self, io: &mut dyn TransactionIo) {
        for (_, token) in self.tokens.drain() {
            io.cancel_timer(token);
        }
    }

    pub(crate) fn is_running(&self, timer: TimerType) -> bool {
        self.tokens.contains_key(&timer)
    }
}
