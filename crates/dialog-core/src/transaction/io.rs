//! The seam between the state machines and the outside world.
//!
//! Transactions and dialogs never touch a socket or a clock. Everything
//! they want to send and every timer they want started goes through a
//! [`TransactionIo`]; the user agent core hands them an [`IoContext`] that
//! queues messages for the runner and records timers in the shared
//! [`TimerScheduler`].

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use sipflow_sip_core::Message;

use super::timer::{TimerScheduler, TimerTarget, TimerToken};
use super::TransactionKey;

/// A message waiting to be written to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub message: Message,
    /// Client or server transaction that produced the message, if any.
    /// A failed send is reported back to it.
    pub origin: Option<TransactionKey>,
}

/// Side effects available to a state machine
pub trait TransactionIo {
    /// Queue a message for the transport
    fn send(&mut self, message: Message, origin: Option<&TransactionKey>);

    /// Start a timer firing `after` from the current time
    fn start_timer(&mut self, target: TimerTarget, after: Duration) -> TimerToken;

    fn cancel_timer(&mut self, token: TimerToken);
}

/// Outbox plus timer scheduler, owned by the user agent core
#[derive(Debug)]
pub struct IoContext {
    now: Instant,
    scheduler: TimerScheduler,
    outbox: Vec<Outgoing>,
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl IoContext {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            scheduler: TimerScheduler::new(),
            outbox: Vec::new(),
        }
    }

    /// Reference time for timers started from now on
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TimerScheduler {
        &mut self.scheduler
    }

    /// Messages queued so far, oldest first
    pub fn outgoing(&self) -> &[Outgoing] {
        &self.outbox
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}

impl TransactionIo for IoContext {
    fn send(&mut self, message: Message, origin: Option<&TransactionKey>) {
        trace!(call_id = %message.call_id(), "Queueing outgoing message");
        self.outbox.push(Outgoing {
            message,
            origin: origin.cloned(),
        });
    }

    fn start_timer(&mut self, target: TimerTarget, after: Duration) -> TimerToken {
        self.scheduler.schedule(self.now + after, target)
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        self.scheduler.cancel(token);
    }
}
