//! Non-INVITE client transaction (RFC 3261 §17.1.2)
//!
//! ```text
//!   Timer E   +-----------+ Timer F: Timeout
//!   resend    |  Trying   |--------------------------+
//!             +-----------+                          |
//!           1xx |     \ 200-699                      |
//!               V      \                             |
//!   Timer E +-----------+ \     +-----------+        |
//!   resend  | Proceeding|--+--->| Completed |        |
//!           +-----------+       +-----------+        |
//!                  | Timer F          | Timer K      |
//!                  V                  V              |
//!                 +--------------------+             |
//!                 |     Terminated     |<------------+
//!                 +--------------------+
//! ```
//!
//! A received 408 is reported to the TU as a timeout rather than as a
//! response.

use std::time::Duration;

use tracing::{debug, trace};

use sipflow_sip_core::prelude::*;

use crate::errors::{TransactionError, TransactionResult};
use crate::transaction::{
    transition, Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState,
    TransactionTimers, TimerSettings, TimerType,
};

#[derive(Debug)]
pub struct NonInviteClientTransaction {
    key: TransactionKey,
    state: TransactionState,
    request: Request,
    reliable: bool,
    settings: TimerSettings,
    timers: TransactionTimers,
    timer_e_interval: Duration,
    last_response: Option<Response>,
}

impl NonInviteClientTransaction {
    pub fn new(request: Request, reliable: bool, settings: TimerSettings) -> TransactionResult<Self> {
        if matches!(request.method, Method::Invite | Method::Ack) {
            return Err(TransactionError::WrongMethod {
                kind: TransactionKind::NonInviteClient,
                method: request.method.clone(),
            });
        }
        let branch = request.branch().filter(|b| !b.is_empty()).ok_or(TransactionError::MissingBranch)?;
        let key = TransactionKey::new(branch, request.method.clone(), false);
        Ok(Self {
            key,
            state: TransactionState::Initial,
            request,
            reliable,
            settings,
            timers: TransactionTimers::default(),
            timer_e_interval: settings.t1,
            last_response: None,
        })
    }

    /// Sends the request and starts Timers E and F
    pub fn start(&mut self, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        transition(self.kind(), &self.key, &mut self.state, TransactionState::Trying)?;
        io.send(self.request.clone().into(), Some(&self.key));
        if !self.reliable {
            self.timers.start(io, &self.key, TimerType::E, self.timer_e_interval);
        }
        self.timers.start(io, &self.key, TimerType::F, self.settings.transaction_timeout());
        Ok(())
    }

    pub fn receive_response(
        &mut self,
        response: Response,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if response.status.is_provisional() {
                    transition(self.kind(), &self.key, &mut self.state, TransactionState::Proceeding)?;
                    self.last_response = Some(response.clone());
                    return Ok(vec![TransactionEvent::Response(response)]);
                }

                transition(self.kind(), &self.key, &mut self.state, TransactionState::Completed)?;
                self.timers.stop(io, TimerType::E);
                self.timers.stop(io, TimerType::F);
                let timed_out = response.status == StatusCode::REQUEST_TIMEOUT;
                self.last_response = Some(response.clone());

                let timer_k = self.settings.timer_k(self.reliable);
                if timer_k.is_zero() {
                    self.dispose(io);
                } else {
                    self.timers.start(io, &self.key, TimerType::K, timer_k);
                }

                if timed_out {
                    debug!(id = %self.key, "408 received, reporting timeout");
                    Ok(vec![TransactionEvent::Timeout])
                } else {
                    Ok(vec![TransactionEvent::Response(response)])
                }
            }
            TransactionState::Completed => {
                trace!(id = %self.key, "Absorbing response retransmission");
                Ok(Vec::new())
            }
            state => Err(TransactionError::InvalidState {
                kind: self.kind(),
                state,
                operation: "receive_response",
            }),
        }
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }
}

impl Transaction for NonInviteClientTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteClient
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
            (TimerType::E, TransactionState::Trying | TransactionState::Proceeding) => {
                trace!(id = %self.key, "Timer E fired, retransmitting {}", self.request.method);
                io.send(self.request.clone().into(), Some(&self.key));
                self.timer_e_interval = if self.state == TransactionState::Trying {
                    self.settings.backoff(self.timer_e_interval)
                } else {
                    self.settings.t2
                };
                self.timers.start(io, &self.key, TimerType::E, self.timer_e_interval);
                Ok(Vec::new())
            }
            (TimerType::F, TransactionState::Trying | TransactionState::Proceeding) => {
                debug!(id = %self.key, "Timer F fired, {} timed out", self.request.method);
                self.dispose(io);
                Ok(vec![TransactionEvent::Timeout])
            }
            (TimerType::K, TransactionState::Completed) => {
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
            debug!(id = %self.key, "NICT state {} -> Terminated", self.state);
            self.state = TransactionState::Terminated;
        }
    }
}
