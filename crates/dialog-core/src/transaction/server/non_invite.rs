//! Non-INVITE server transaction (RFC 3261 §17.2.2)
//!
//! ```text
//!                   |Request received
//!                   V
//!             +-----------+
//!             |  Trying   |-------------+
//!             +-----------+             | 200-699 from TU
//!       100 from TU |                   |
//!                   V                   |
//!   Request   +-----------+             |
//!   resend 1xx| Proceeding|-------------+
//!             +-----------+ 200-699     |
//!                                       V
//!   Request   +-----------+
//!   resend    | Completed |  Timer J
//!   final     +-----------+-----------> Terminated
//! ```
//!
//! Only 100 Trying may be sent as a provisional response (RFC 4320).

use tracing::{debug, trace};

use sipflow_sip_core::prelude::*;

use crate::errors::{TransactionError, TransactionResult};
use crate::transaction::{
    transition, Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState,
    TransactionTimers, TimerSettings, TimerType,
};

#[derive(Debug)]
pub struct NonInviteServerTransaction {
    key: TransactionKey,
    state: TransactionState,
    request: Request,
    reliable: bool,
    settings: TimerSettings,
    timers: TransactionTimers,
    last_response: Option<Response>,
}

impl NonInviteServerTransaction {
    pub fn new(request: Request, reliable: bool, settings: TimerSettings) -> TransactionResult<Self> {
        if matches!(request.method, Method::Invite | Method::Ack) {
            return Err(TransactionError::WrongMethod {
                kind: TransactionKind::NonInviteServer,
                method: request.method.clone(),
            });
        }
        let key = TransactionKey::from_request(&request).ok_or(TransactionError::MissingBranch)?;
        Ok(Self {
            key,
            state: TransactionState::Trying,
            request,
            reliable,
            settings,
            timers: TransactionTimers::default(),
            last_response: None,
        })
    }

    /// Handles a retransmission of the request
    pub fn receive_request(
        &mut self,
        request: Request,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        if request.method != self.request.method {
            return Err(TransactionError::WrongMethod {
                kind: self.kind(),
                method: request.method,
            });
        }
        match self.state {
            TransactionState::Trying => {
                trace!(id = %self.key, "Absorbing retransmission in Trying");
                Ok(Vec::new())
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                if let Some(response) = &self.last_response {
                    trace!(id = %self.key, "Retransmission, re-sending {}", response.status);
                    io.send(response.clone().into(), Some(&self.key));
                }
                Ok(Vec::new())
            }
            state => Err(TransactionError::InvalidState {
                kind: self.kind(),
                state,
                operation: "receive_request",
            }),
        }
    }

    pub fn respond(&mut self, response: Response, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        let status = response.status;
        if status.is_provisional() && status != StatusCode::TRYING {
            return Err(TransactionError::InvalidStatus {
                status,
                reason: "only 100 Trying may be sent on a non-INVITE transaction",
            });
        }
        let next = if status.is_provisional() {
            TransactionState::Proceeding
        } else {
            TransactionState::Completed
        };
        if !matches!(self.state, TransactionState::Trying | TransactionState::Proceeding) {
            return Err(TransactionError::InvalidState {
                kind: self.kind(),
                state: self.state,
                operation: "respond",
            });
        }
        transition(self.kind(), &self.key, &mut self.state, next)?;
        io.send(response.clone().into(), Some(&self.key));
        self.last_response = Some(response);

        if next == TransactionState::Completed {
            let timer_j = self.settings.timer_j(self.reliable);
            if timer_j.is_zero() {
                self.dispose(io);
            } else {
                self.timers.start(io, &self.key, TimerType::J, timer_j);
            }
        }
        Ok(())
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }
}

impl Transaction for NonInviteServerTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteServer
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn on_timer(&mut self, timer: TimerType, io: &mut dyn TransactionIo) -> TransactionResult<Vec<TransactionEvent>> {
        self.timers.fired(timer);
        if timer == TimerType::J && self.state == TransactionState::Completed {
            self.dispose(io);
        } else {
            trace!(id = %self.key, "Ignoring Timer {} in {}", timer, self.state);
        }
        Ok(Vec::new())
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
            debug!(id = %self.key, "NIST state {} -> Terminated", self.state);
            self.state = TransactionState::Terminated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{request, response_to, TestIo};

    fn server(reliable: bool) -> (NonInviteServerTransaction, TestIo) {
        let tx = NonInviteServerTransaction::new(request(Method::Message, "z9hG4bKnist"), reliable, TimerSettings::default())
            .unwrap();
        (tx, TestIo::new())
    }

    #[test]
    fn test_only_100_is_permitted() {
        let (mut tx, mut io) = server(false);
        let request = tx.request().clone();
        let err = tx.respond(response_to(&request, 180, None), &mut io).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidStatus { .. }));
        assert_eq!(tx.state(), TransactionState::Trying);

        tx.respond(response_to(&request, 100, None), &mut io).unwrap();
        assert_eq!(tx.state(), TransactionState::Proceeding);
    }

    #[test]
    fn test_retransmission_resends_cached_final() {
        let (mut tx, mut io) = server(false);
        let request = tx.request().clone();
        // Absorbed while Trying
        assert!(tx.receive_request(request.clone(), &mut io).unwrap().is_empty());
        assert!(io.sent.is_empty());

        tx.respond(response_to(&request, 202, Some("x")), &mut io).unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(io.has_timer(TimerType::J));
        for _ in 0..2 {
            assert!(tx.receive_request(request.clone(), &mut io).unwrap().is_empty());
        }
        assert_eq!(io.responses(), vec![202, 202, 202]);
    }

    #[test]
    fn test_second_final_is_refused() {
        let (mut tx, mut io) = server(false);
        let request = tx.request().clone();
        tx.respond(response_to(&request, 200, Some("x")), &mut io).unwrap();
        let err = tx.respond(response_to(&request, 500, Some("x")), &mut io).unwrap_err();
        assert!(err.is_state_error());
        assert_eq!(io.responses(), vec![200]);
    }

    #[test]
    fn test_reliable_terminates_immediately() {
        let (mut tx, mut io) = server(true);
        let request = tx.request().clone();
        tx.respond(response_to(&request, 200, Some("x")), &mut io).unwrap();
        assert!(tx.is_terminated());
        assert!(!io.has_timer(TimerType::J));
    }
}
