//! INVITE client transaction (RFC 3261 §17.1.1, RFC 6026 §7.2)
//!
//! ```text
//!                 |INVITE sent, Timer A (unreliable), Timer B
//!                 V
//!   Timer A   +-----------+ Timer B: Timeout
//!   resend    |  Calling  |-------------------------------+
//!   +-------->|           |                               |
//!   +---------+-----------+                               |
//!              1xx |    \ 2xx            300-699          |
//!                  V     \               ACK sent         |
//!             +-----------+  \      +-----------+         |
//!             | Proceeding|---+---->| Completed |         |
//!             +-----------+   |     +-----------+         |
//!                  2xx |      |           | Timer D       |
//!                      V      V           V               |
//!             +-----------+  Timer M  +------------+      |
//!             |  Accepted |---------->| Terminated |<-----+
//!             +-----------+           +------------+
//! ```
//!
//! In Accepted every 2xx is handed to the TU except those whose To-tag has
//! an ACK in the cache: for those the cached ACK is re-sent instead.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use sipflow_sip_core::prelude::*;

use crate::errors::{TransactionError, TransactionResult};
use crate::transaction::{
    transition, Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState,
    TransactionTimers, TimerSettings, TimerType,
};
use crate::transaction::utils::create_ack_from_invite;

#[derive(Debug)]
pub struct InviteClientTransaction {
    key: TransactionKey,
    state: TransactionState,
    request: Request,
    reliable: bool,
    settings: TimerSettings,
    timers: TransactionTimers,
    timer_a_interval: Duration,
    last_response: Option<Response>,
    /// ACK for a 300-699 final response, built by the transaction
    ack: Option<Request>,
    /// ACKs for 2xx responses, one per To-tag, built by the dialog layer
    ack_cache: HashMap<String, Request>,
    max_acks: usize,
}

impl InviteClientTransaction {
    /// Wraps an INVITE whose top Via already carries the branch.
    ///
    /// `max_forks` bounds the number of 2xx ACKs kept for retransmission.
    pub fn new(request: Request, reliable: bool, settings: TimerSettings, max_forks: usize) -> TransactionResult<Self> {
        if request.method != Method::Invite {
            return Err(TransactionError::WrongMethod {
                kind: TransactionKind::InviteClient,
                method: request.method.clone(),
            });
        }
        let branch = request.branch().filter(|b| !b.is_empty()).ok_or(TransactionError::MissingBranch)?;
        let key = TransactionKey::new(branch, Method::Invite, false);
        Ok(Self {
            key,
            state: TransactionState::Initial,
            request,
            reliable,
            settings,
            timers: TransactionTimers::default(),
            timer_a_interval: settings.t1,
            last_response: None,
            ack: None,
            ack_cache: HashMap::new(),
            max_acks: max_forks.max(1),
        })
    }

    /// Sends the INVITE and starts Timers A and B
    pub fn start(&mut self, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        transition(self.kind(), &self.key, &mut self.state, TransactionState::Calling)?;
        io.send(self.request.clone().into(), Some(&self.key));
        if !self.reliable {
            self.timers.start(io, &self.key, TimerType::A, self.timer_a_interval);
        }
        self.timers.start(io, &self.key, TimerType::B, self.settings.transaction_timeout());
        Ok(())
    }

    pub fn receive_response(
        &mut self,
        response: Response,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        let status = response.status;
        match self.state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if status.is_provisional() {
                    transition(self.kind(), &self.key, &mut self.state, TransactionState::Proceeding)?;
                    self.timers.stop(io, TimerType::A);
                    self.timers.stop(io, TimerType::B);
                } else if status.is_success() {
                    transition(self.kind(), &self.key, &mut self.state, TransactionState::Accepted)?;
                    self.timers.stop(io, TimerType::A);
                    self.timers.stop(io, TimerType::B);
                    self.timers.start(io, &self.key, TimerType::M, self.settings.transaction_timeout());
                } else {
                    transition(self.kind(), &self.key, &mut self.state, TransactionState::Completed)?;
                    self.timers.stop(io, TimerType::A);
                    self.timers.stop(io, TimerType::B);
                    let ack = create_ack_from_invite(&self.request, &response);
                    io.send(ack.clone().into(), Some(&self.key));
                    self.ack = Some(ack);
                    self.start_or_terminate(io, TimerType::D, self.settings.timer_d(self.reliable));
                }
                self.last_response = Some(response.clone());
                Ok(vec![TransactionEvent::Response(response)])
            }
            TransactionState::Accepted => {
                if !status.is_success() {
                    trace!(id = %self.key, "Absorbing {} in Accepted", status);
                    return Ok(Vec::new());
                }
                if let Some(ack) = response.to_tag().and_then(|tag| self.ack_cache.get(tag)) {
                    trace!(id = %self.key, "2xx retransmission, re-sending cached ACK");
                    io.send(ack.clone().into(), Some(&self.key));
                    return Ok(Vec::new());
                }
                Ok(vec![TransactionEvent::Response(response)])
            }
            TransactionState::Completed => {
                if status.is_failure_or_redirect() {
                    if let Some(ack) = &self.ack {
                        trace!(id = %self.key, "Final response retransmission, re-sending ACK");
                        io.send(ack.clone().into(), Some(&self.key));
                    }
                }
                Ok(Vec::new())
            }
            state => Err(TransactionError::InvalidState {
                kind: self.kind(),
                state,
                operation: "receive_response",
            }),
        }
    }

    /// Remembers the ACK the dialog layer sent for the 2xx with `to_tag`.
    ///
    /// Returns `false` when the cache already holds `max_forks` other ACKs.
    pub fn cache_ack(&mut self, to_tag: &str, ack: Request) -> bool {
        if !self.ack_cache.contains_key(to_tag) && self.ack_cache.len() >= self.max_acks {
            debug!(id = %self.key, "ACK cache full, not caching ACK for To-tag {}", to_tag);
            return false;
        }
        self.ack_cache.insert(to_tag.to_string(), ack);
        true
    }

    pub fn cached_ack(&self, to_tag: &str) -> Option<&Request> {
        self.ack_cache.get(to_tag)
    }

    pub fn ack_cache_len(&self) -> usize {
        self.ack_cache.len()
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    fn start_or_terminate(&mut self, io: &mut dyn TransactionIo, timer: TimerType, after: Duration) {
        if after.is_zero() {
            self.dispose(io);
        } else {
            self.timers.start(io, &self.key, timer, after);
        }
    }
}

impl Transaction for InviteClientTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteClient
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn on_timer(&mut self, timer: TimerType, io: &mut dyn TransactionIo) -> TransactionResult<Vec<TransactionEvent>> {
        self.timers.fired(timer);
        match (timer, self.state) {
            (TimerType::A, TransactionState::Calling) => {
                trace!(id = %self.key, "Timer A fired, retransmitting INVITE");
                io.send(self.request.clone().into(), Some(&self.key));
                self.timer_a_interval *= 2;
                self.timers.start(io, &self.key, TimerType::A, self.timer_a_interval);
                Ok(Vec::new())
            }
            (TimerType::B, TransactionState::Calling) => {
                debug!(id = %self.key, "Timer B fired, INVITE timed out");
                self.dispose(io);
                Ok(vec![TransactionEvent::Timeout])
            }
            (TimerType::D, TransactionState::Completed) | (TimerType::M, TransactionState::Accepted) => {
                trace!(id = %self.key, "Timer {} fired", timer);
                self.dispose(io);
                Ok(Vec::new())
            }
            (timer, state) => {
                trace!(id = %self.key, "Ignoring Timer {} in {}", timer, state);
                Ok(Vec::new())
            }
        }
    }

    fn on_transport_error(&mut self, io: &mut dyn TransactionIo) -> Vec<TransactionEvent> {
        if self.state.is_terminated() {
            return Vec::new();
        }
        self.dispose(io);
        vec![TransactionEvent::TransportError]
    }

    fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.timers.stop_all(io);
        if !self.state.is_terminated() {
            debug!(id = %self.key, "ICT state {} -> Terminated", self.state);
            self.state = TransactionState::Terminated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{invite, response_to, TestIo};

    fn started() -> (InviteClientTransaction, TestIo) {
        let mut io = TestIo::new();
        let mut tx = InviteClientTransaction::new(invite("z9hG4bKict"), false, TimerSettings::default(), 4).unwrap();
        tx.start(&mut io).unwrap();
        (tx, io)
    }

    #[test]
    fn test_start_sends_invite_and_arms_a_and_b() {
        let (tx, io) = started();
        assert_eq!(tx.state(), TransactionState::Calling);
        assert_eq!(io.sent.len(), 1);
        assert!(io.has_timer(TimerType::A));
        assert!(io.has_timer(TimerType::B));
    }

    #[test]
    fn test_timer_a_doubles() {
        let (mut tx, mut io) = started();
        tx.on_timer(TimerType::A, &mut io).unwrap();
        tx.on_timer(TimerType::A, &mut io).unwrap();
        assert_eq!(io.sent.len(), 3);
        assert_eq!(io.last_duration(TimerType::A), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_provisional_then_success_moves_to_accepted() {
        let (mut tx, mut io) = started();
        let request = tx.request().clone();
        let events = tx.receive_response(response_to(&request, 180, Some("b1")), &mut io).unwrap();
        assert!(matches!(&events[..], [TransactionEvent::Response(r)] if r.status.as_u16() == 180));
        assert_eq!(tx.state(), TransactionState::Proceeding);
        assert!(!io.has_timer(TimerType::A));

        tx.receive_response(response_to(&request, 200, Some("b1")), &mut io).unwrap();
        assert_eq!(tx.state(), TransactionState::Accepted);
        assert!(io.has_timer(TimerType::M));

        tx.on_timer(TimerType::M, &mut io).unwrap();
        assert!(tx.is_terminated());
        assert!(!io.has_timer(TimerType::A) && !io.has_timer(TimerType::B));
    }

    #[test]
    fn test_failure_sends_ack_and_absorbs_retransmissions() {
        let (mut tx, mut io) = started();
        let request = tx.request().clone();
        let busy = response_to(&request, 486, Some("b1"));
        let events = tx.receive_response(busy.clone(), &mut io).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(tx.state(), TransactionState::Completed);

        let ack = io.last_request().unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.cseq().seq, request.cseq().seq);
        assert_eq!(ack.branch(), request.branch());
        assert_eq!(ack.to_tag(), Some("b1"));

        let events = tx.receive_response(busy, &mut io).unwrap();
        assert!(events.is_empty());
        assert_eq!(io.sent.len(), 3);
        assert!(io.has_timer(TimerType::D));
    }

    #[test]
    fn test_cached_ack_is_resent_for_2xx_retransmission() {
        let (mut tx, mut io) = started();
        let request = tx.request().clone();
        let ok = response_to(&request, 200, Some("b1"));
        tx.receive_response(ok.clone(), &mut io).unwrap();

        let mut ack = request.clone();
        ack.method = Method::Ack;
        assert!(tx.cache_ack("b1", ack));

        let before = io.sent.len();
        assert!(tx.receive_response(ok, &mut io).unwrap().is_empty());
        assert_eq!(io.sent.len(), before + 1);

        // A new To-tag is a fork and goes to the TU
        let fork = response_to(&request, 200, Some("b2"));
        assert_eq!(tx.receive_response(fork, &mut io).unwrap().len(), 1);
    }

    #[test]
    fn test_ack_cache_is_bounded() {
        let mut io = TestIo::new();
        let mut tx = InviteClientTransaction::new(invite("z9hG4bKb"), true, TimerSettings::default(), 1).unwrap();
        tx.start(&mut io).unwrap();
        let ack = tx.request().clone();
        assert!(tx.cache_ack("a", ack.clone()));
        assert!(!tx.cache_ack("b", ack.clone()));
        assert!(tx.cache_ack("a", ack));
        assert_eq!(tx.ack_cache_len(), 1);
    }

    #[test]
    fn test_timer_b_times_out() {
        let (mut tx, mut io) = started();
        let events = tx.on_timer(TimerType::B, &mut io).unwrap();
        assert_eq!(events, vec![TransactionEvent::Timeout]);
        assert!(tx.is_terminated());
    }

    #[test]
    fn test_response_after_termination_is_refused() {
        let (mut tx, mut io) = started();
        let request = tx.request().clone();
        tx.on_transport_error(&mut io);
        let err = tx.receive_response(response_to(&request, 200, Some("x")), &mut io).unwrap_err();
        assert!(err.is_state_error());
        assert!(tx.is_terminated());
    }

    #[test]
    fn test_reliable_transport_terminates_on_failure() {
        let mut io = TestIo::new();
        let mut tx = InviteClientTransaction::new(invite("z9hG4bKr"), true, TimerSettings::default(), 4).unwrap();
        tx.start(&mut io).unwrap();
        assert!(!io.has_timer(TimerType::A));
        let request = tx.request().clone();
        tx.receive_response(response_to(&request, 404, Some("t")), &mut io).unwrap();
        assert!(tx.is_terminated());
    }
}
