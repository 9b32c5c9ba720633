//! INVITE server transaction (RFC 3261 §17.2.1, RFC 6026 §7.1)
//!
//! ```text
//!                    |INVITE received, 100 Trying after 200 ms
//!                    V
//!   INVITE    +-----------+
//!   resend 1xx| Proceeding|---------------------+
//!             +-----------+  2xx from TU        |
//!  300-699 from TU |                            V
//!                  V                     +-----------+
//!   INVITE    +-----------+              |  Accepted | ACK: to TU
//!   resend    | Completed | Timer G      +-----------+
//!   final     +-----------+ resend             |
//!        ACK  |       | Timer H: Timeout       | Timer L
//!             V       |                        |
//!      +-----------+  |                        |
//!      | Confirmed |  |                        |
//!      +-----------+  |                        |
//!   Timer I  |        V                        V
//!            +--->+------------------------------+
//!                 |          Terminated          |
//!                 +------------------------------+
//! ```

use std::time::Duration;

use tracing::{debug, trace};

use sipflow_sip_core::prelude::*;

use crate::errors::{TransactionError, TransactionResult};
use crate::transaction::timer::TRYING_DELAY;
use crate::transaction::{
    transition, Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState,
    TransactionTimers, TimerSettings, TimerType,
};

#[derive(Debug)]
pub struct InviteServerTransaction {
    key: TransactionKey,
    state: TransactionState,
    request: Request,
    reliable: bool,
    settings: TimerSettings,
    timers: TransactionTimers,
    timer_g_interval: Duration,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl InviteServerTransaction {
    pub fn new(request: Request, reliable: bool, settings: TimerSettings) -> TransactionResult<Self> {
        if request.method != Method::Invite {
            return Err(TransactionError::WrongMethod {
                kind: TransactionKind::InviteServer,
                method: request.method.clone(),
            });
        }
        let key = TransactionKey::from_request(&request).ok_or(TransactionError::MissingBranch)?;
        Ok(Self {
            key,
            state: TransactionState::Proceeding,
            request,
            reliable,
            settings,
            timers: TransactionTimers::default(),
            timer_g_interval: settings.t1,
            last_provisional: None,
            last_final: None,
        })
    }

    /// Arms the automatic 100 Trying
    pub fn start(&mut self, io: &mut dyn TransactionIo) {
        self.timers.start(io, &self.key, TimerType::Trying, TRYING_DELAY);
    }

    /// Handles a retransmitted INVITE or an ACK
    pub fn receive_request(
        &mut self,
        request: Request,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        let method = request.method.clone();
        match (&method, self.state) {
            (_, TransactionState::Terminated) => Err(TransactionError::InvalidState {
                kind: self.kind(),
                state: self.state,
                operation: "receive_request",
            }),
            (Method::Invite, TransactionState::Proceeding) => {
                if let Some(provisional) = &self.last_provisional {
                    trace!(id = %self.key, "INVITE retransmission, re-sending {}", provisional.status);
                    io.send(provisional.clone().into(), Some(&self.key));
                }
                Ok(Vec::new())
            }
            (Method::Invite, TransactionState::Completed) => {
                if let Some(response) = &self.last_final {
                    trace!(id = %self.key, "INVITE retransmission, re-sending {}", response.status);
                    io.send(response.clone().into(), Some(&self.key));
                }
                Ok(Vec::new())
            }
            (Method::Invite, _) => Ok(Vec::new()),
            (Method::Ack, TransactionState::Completed) => {
                transition(self.kind(), &self.key, &mut self.state, TransactionState::Confirmed)?;
                self.timers.stop(io, TimerType::G);
                self.timers.stop(io, TimerType::H);
                let timer_i = self.settings.timer_i(self.reliable);
                if timer_i.is_zero() {
                    self.dispose(io);
                } else {
                    self.timers.start(io, &self.key, TimerType::I, timer_i);
                }
                Ok(Vec::new())
            }
            (Method::Ack, TransactionState::Accepted) => Ok(vec![TransactionEvent::AckReceived(request)]),
            (Method::Ack, TransactionState::Confirmed) => Ok(Vec::new()),
            (Method::Ack, state) => Err(TransactionError::InvalidState {
                kind: self.kind(),
                state,
                operation: "ACK before a final response",
            }),
            (method, _) => Err(TransactionError::WrongMethod {
                kind: self.kind(),
                method: method.clone(),
            }),
        }
    }

    /// Sends a response from the TU
    pub fn respond(&mut self, response: Response, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        let status = response.status;
        match self.state {
            TransactionState::Proceeding if status.is_provisional() => {
                self.timers.stop(io, TimerType::Trying);
                io.send(response.clone().into(), Some(&self.key));
                self.last_provisional = Some(response);
            }
            TransactionState::Proceeding if status.is_success() => {
                transition(self.kind(), &self.key, &mut self.state, TransactionState::Accepted)?;
                self.timers.stop(io, TimerType::Trying);
                io.send(response.clone().into(), Some(&self.key));
                self.last_final = Some(response);
                self.timers.start(io, &self.key, TimerType::L, self.settings.transaction_timeout());
            }
            TransactionState::Proceeding => {
                transition(self.kind(), &self.key, &mut self.state, TransactionState::Completed)?;
                self.timers.stop(io, TimerType::Trying);
                io.send(response.clone().into(), Some(&self.key));
                self.last_final = Some(response);
                if !self.reliable {
                    self.timers.start(io, &self.key, TimerType::G, self.timer_g_interval);
                }
                self.timers.start(io, &self.key, TimerType::H, self.settings.transaction_timeout());
            }
            // 2xx retransmissions from the dialog layer pass through Accepted
            TransactionState::Accepted if status.is_success() => {
                io.send(response.into(), Some(&self.key));
            }
            state => {
                return Err(TransactionError::InvalidState {
                    kind: self.kind(),
                    state,
                    operation: "respond",
                });
            }
        }
        Ok(())
    }

    pub fn last_final(&self) -> Option<&Response> {
        self.last_final.as_ref()
    }

    pub fn has_responded(&self) -> bool {
        self.last_provisional.is_some() || self.last_final.is_some()
    }
}

impl Transaction for InviteServerTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteServer
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
            (TimerType::Trying, TransactionState::Proceeding) if self.last_provisional.is_none() => {
                trace!(id = %self.key, "TU silent for 200 ms, sending 100 Trying");
                let trying = Response::for_request(StatusCode::TRYING, &self.request);
                io.send(trying.clone().into(), Some(&self.key));
                self.last_provisional = Some(trying);
                Ok(Vec::new())
            }
            (TimerType::G, TransactionState::Completed) => {
                if let Some(response) = &self.last_final {
                    trace!(id = %self.key, "Timer G fired, re-sending {}", response.status);
                    io.send(response.clone().into(), Some(&self.key));
                }
                self.timer_g_interval = self.settings.backoff(self.timer_g_interval);
                self.timers.start(io, &self.key, TimerType::G, self.timer_g_interval);
                Ok(Vec::new())
            }
            (TimerType::H, TransactionState::Completed) => {
                debug!(id = %self.key, "Timer H fired, no ACK received");
                self.dispose(io);
                Ok(vec![TransactionEvent::Timeout])
            }
            (TimerType::I, TransactionState::Confirmed) | (TimerType::L, TransactionState::Accepted) => {
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
            debug!(id = %self.key, "IST state {} -> Terminated", self.state);
            self.state = TransactionState::Terminated;
        }
    }
}
