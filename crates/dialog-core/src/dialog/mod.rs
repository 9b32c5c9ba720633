//! Dialog layer
//!
//! A dialog is the peer-to-peer relationship that persists between two user
//! agents for some time (RFC 3261 §12). This module provides:
//!
//! - [`Dialog`]: identity, CSeq bookkeeping, route set and in-dialog request
//!   construction shared by every usage
//! - [`SessionDialog`]: an INVITE usage adding the offer/answer signaling
//!   state, 2xx retransmission and reliable provisionals
//! - [`SubscriptionDialog`]: a SUBSCRIBE/NOTIFY usage with refresh and
//!   expiration timers
//!
//! ```text
//!   INVITE/2xx ──► Dialog::new_uac / new_uas ──► SessionDialog
//!   SUBSCRIBE/2xx or NOTIFY ──────────────────► SubscriptionDialog
//! ```
//!
//! Like transactions, dialogs are synchronous and do their I/O through a
//! [`TransactionIo`](crate::transaction::TransactionIo).

pub mod dialog_id;
pub mod dialog_impl;
pub mod session;
pub mod subscription;

use std::collections::HashMap;
use std::time::Duration;

use tracing::trace;

pub use dialog_id::DialogId;
pub use dialog_impl::{Dialog, DialogState};
pub use session::{SessionDialog, SessionTimerOutcome, SignalingState};
pub use subscription::{SubscriptionDialog, SubscriptionRole, SubscriptionState, SubscriptionTimerOutcome};

use crate::transaction::timer::{DialogTimer, TimerTarget, TimerToken};
use crate::transaction::TransactionIo;

/// Timer tokens owned by one dialog usage
#[derive(Debug, Default, Clone)]
pub(crate) struct DialogTimers {
    tokens: HashMap<DialogTimer, TimerToken>,
}

impl DialogTimers {
    /// Starts (or restarts) `timer`
    pub(crate) fn start(&mut self, io: &mut dyn TransactionIo, id: &DialogId, timer: DialogTimer, after: Duration) {
        self.stop(io, timer);
        trace!(dialog = %id, "Starting {} ({:?})", timer, after);
        let token = io.start_timer(TimerTarget::Dialog(id.clone(), timer), after);
        self.tokens.insert(timer, token);
    }

    pub(crate) fn stop(&mut self, io: &mut dyn TransactionIo, timer: DialogTimer) {
        if let Some(token) = self.tokens.remove(&timer) {
            io.cancel_timer(token);
        }
    }

    pub(crate) fn fired(&mut self, timer: DialogTimer) {
        self.tokens.remove(&timer);
    }

    pub(crate) fn stop_all(&mut self, io: &mut dyn TransactionIo) {
        for (_, token) in self.tokens.drain() {
            io.cancel_timer(token);
        }
    }

    pub(crate) fn is_running(&self, timer: DialogTimer) -> bool {
        self.tokens.contains_key(&timer)
    }
}
