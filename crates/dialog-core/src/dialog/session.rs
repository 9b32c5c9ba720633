//! INVITE dialog usage
//!
//! [`SessionDialog`] layers three things on top of [`Dialog`]:
//!
//! ```text
//!                     outgoing body                incoming body
//!   Initial/Stable ─────────────────► HaveLocalOffer ──────────────► Stable
//!         │                                                            ▲
//!         │ incoming body                           outgoing body      │
//!         └────────────────────────► HaveRemoteOffer ─────────────────┘
//! ```
//!
//! - the offer/answer signaling state (RFC 3264), with a snapshot taken
//!   when an offer leaves Stable so a failed re-INVITE or UPDATE can roll
//!   back
//! - 2xx retransmission while the UAS waits for the ACK (RFC 3261 §13.3.1.4)
//! - reliable provisional responses and PRACK (RFC 3262)

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sipflow_sip_core::prelude::*;

use super::{Dialog, DialogId, DialogTimers};
use crate::errors::{DialogError, DialogResult};
use crate::transaction::timer::{DialogTimer, TimerSettings};
use crate::transaction::TransactionIo;
use crate::user_agent::options::{Body, RequestOptions};

/// Offer/answer state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingState {
    Initial,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// What a fired session timer asks the user agent core to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimerOutcome {
    /// A 2xx or reliable provisional was sent again
    Retransmitted,
    /// No ACK for our 2xx: send BYE and terminate the dialog
    AckTimedOut,
    /// No PRACK for our reliable provisional: reject the INVITE with 504
    PrackTimedOut,
    /// Stale timer
    Ignored,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: SignalingState,
    offer: Option<Body>,
    answer: Option<Body>,
}

/// A dialog created by INVITE
#[derive(Debug, Clone)]
pub struct SessionDialog {
    dialog: Dialog,
    settings: TimerSettings,
    reliable_transport: bool,

    signaling_state: SignalingState,
    offer: Option<Body>,
    answer: Option<Body>,
    rollback: Option<Snapshot>,

    // UAS: 2xx awaiting its ACK
    pending_2xx: Option<Response>,
    retransmit_2xx_interval: Duration,

    // UAS: reliable provisionals sent
    local_rseq: Option<u32>,
    unacked_1xx: Option<Response>,
    retransmit_1xx_interval: Duration,

    // UAC: reliable provisionals received
    remote_rseq: Option<u32>,
    pending_rack: Option<String>,

    timers: DialogTimers,
}

/// The session description carried by a message, if any
fn session_body(headers: &MessageHeaders, body: &Bytes) -> Option<Body> {
    if body.is_empty() {
        return None;
    }
    let content_type = headers.get(&HeaderName::ContentType)?;
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("application/sdp")
        .then(|| Body::new(content_type, body.clone()))
}

fn same_content(current: Option<&Body>, body: &Body) -> bool {
    current.is_some_and(|c| c.content == body.content)
}

impl SessionDialog {
    pub fn new(dialog: Dialog, settings: TimerSettings, reliable_transport: bool) -> Self {
        info!(dialog = %dialog.id, "Session dialog created ({:?})", dialog.state);
        Self {
            dialog,
            settings,
            reliable_transport,
            signaling_state: SignalingState::Initial,
            offer: None,
            answer: None,
            rollback: None,
            pending_2xx: None,
            retransmit_2xx_interval: settings.t1,
            local_rseq: None,
            unacked_1xx: None,
            retransmit_1xx_interval: settings.t1,
            remote_rseq: None,
            pending_rack: None,
            timers: DialogTimers::default(),
        }
    }

    pub fn id(&self) -> &DialogId {
        &self.dialog.id
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn dialog_mut(&mut self) -> &mut Dialog {
        &mut self.dialog
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    /// Most recent offer
    pub fn offer(&self) -> Option<&Body> {
        self.offer.as_ref()
    }

    /// Answer to [`offer`](Self::offer), once there is one
    pub fn answer(&self) -> Option<&Body> {
        self.answer.as_ref()
    }

    /// Feeds a message body through the offer/answer state machine.
    ///
    /// Messages without a session description change nothing, and neither
    /// does a repeated copy of the current offer or answer (a 2xx repeating
    /// the answer already sent in a reliable provisional, for example). A
    /// second offer while one is outstanding is refused with
    /// [`DialogError::OfferConflict`].
    pub fn signaling_state_transition(
        &mut self,
        headers: &MessageHeaders,
        body: &Bytes,
        outgoing: bool,
    ) -> DialogResult<()> {
        let Some(body) = session_body(headers, body) else {
            return Ok(());
        };
        let previous = self.signaling_state;
        match (self.signaling_state, outgoing) {
            (SignalingState::Closed, _) => {
                return Err(DialogError::invalid_state(format!(
                    "session description on closed session {}",
                    self.dialog.id
                )));
            }
            (SignalingState::Stable, _)
                if same_content(self.answer.as_ref(), &body) || same_content(self.offer.as_ref(), &body) =>
            {
                return Ok(());
            }
            (SignalingState::Initial | SignalingState::Stable, _) => {
                self.rollback = Some(Snapshot {
                    state: self.signaling_state,
                    offer: self.offer.take(),
                    answer: self.answer.take(),
                });
                self.offer = Some(body);
                self.signaling_state = if outgoing {
                    SignalingState::HaveLocalOffer
                } else {
                    SignalingState::HaveRemoteOffer
                };
            }
            (SignalingState::HaveLocalOffer, false) | (SignalingState::HaveRemoteOffer, true) => {
                self.answer = Some(body);
                self.rollback = None;
                self.signaling_state = SignalingState::Stable;
            }
            (SignalingState::HaveLocalOffer, true) | (SignalingState::HaveRemoteOffer, false)
                if same_content(self.offer.as_ref(), &body) =>
            {
                return Ok(());
            }
            (SignalingState::HaveLocalOffer, true) => {
                return Err(DialogError::OfferConflict {
                    status: StatusCode::REQUEST_PENDING,
                    message: "local offer already outstanding".to_string(),
                });
            }
            (SignalingState::HaveRemoteOffer, false) => {
                return Err(DialogError::OfferConflict {
                    status: StatusCode::SERVER_INTERNAL_ERROR,
                    message: "remote offer already outstanding".to_string(),
                });
            }
        }
        debug!(dialog = %self.dialog.id, "Signaling state {:?} -> {:?}", previous, self.signaling_state);
        Ok(())
    }

    /// Offer/answer transition for a request we send or receive
    pub fn apply_request(&mut self, request: &Request, outgoing: bool) -> DialogResult<()> {
        self.signaling_state_transition(&request.headers, &request.body, outgoing)
    }

    /// Offer/answer transition for a response we send or receive
    pub fn apply_response(&mut self, response: &Response, outgoing: bool) -> DialogResult<()> {
        self.signaling_state_transition(&response.headers, &response.body, outgoing)
    }

    /// Restores the offer/answer state saved when the last offer left
    /// Stable. Returns whether there was anything to restore.
    pub fn signaling_state_rollback(&mut self) -> bool {
        match self.rollback.take() {
            Some(snapshot) => {
                debug!(dialog = %self.dialog.id, "Signaling state rolled back to {:?}", snapshot.state);
                self.signaling_state = snapshot.state;
                self.offer = snapshot.offer;
                self.answer = snapshot.answer;
                true
            }
            None => false,
        }
    }

    /// Refuses an incoming re-INVITE or UPDATE whose offer would collide
    /// with one already outstanding (RFC 3261 §14.2, RFC 3311 §5.2)
    pub fn check_incoming_offer(&self, request: &Request) -> DialogResult<()> {
        if session_body(&request.headers, &request.body).is_none() {
            return Ok(());
        }
        match self.signaling_state {
            SignalingState::HaveLocalOffer => Err(DialogError::OfferConflict {
                status: StatusCode::REQUEST_PENDING,
                message: "offer received while a local offer is outstanding".to_string(),
            }),
            SignalingState::HaveRemoteOffer => Err(DialogError::OfferConflict {
                status: StatusCode::SERVER_INTERNAL_ERROR,
                message: "offer received while a remote offer is pending".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Accepts an in-dialog request (other than ACK and PRACK) from the
    /// peer. Checks CSeq order, then offer collisions, then applies it.
    /// An offer refused with 491 or 500 still advances the remote CSeq.
    pub fn receive_request(&mut self, request: &Request) -> DialogResult<()> {
        self.dialog.advance_remote_seq(request)?;
        if matches!(request.method, Method::Invite | Method::Update) {
            self.check_incoming_offer(request)?;
        }
        self.dialog.refresh_target_from_request(request);
        if request.method == Method::Invite {
            self.dialog.invite_seq = request.cseq().seq;
        }
        if matches!(request.method, Method::Invite | Method::Update) {
            self.apply_request(request, false)?;
        }
        Ok(())
    }

    /// In-dialog request carrying `options`, with its offer or answer applied
    pub fn create_request(&mut self, method: Method, options: &RequestOptions) -> DialogResult<Request> {
        let request = self.dialog.create_outgoing_request_message(method, options)?;
        if matches!(request.method, Method::Invite | Method::Update | Method::Ack | Method::Prack) {
            self.apply_request(&request, true)?;
        }
        Ok(request)
    }

    /// ACK for the 2xx to our latest INVITE
    pub fn create_ack(&mut self, options: &RequestOptions) -> DialogResult<Request> {
        self.create_request(Method::Ack, options)
    }

    // ---- UAS: 2xx retransmission -------------------------------------------

    /// Starts re-sending `response` until the ACK arrives
    pub fn start_ack_wait(&mut self, response: Response, io: &mut dyn TransactionIo) {
        self.retransmit_2xx_interval = self.settings.t1;
        if !self.reliable_transport {
            self.timers
                .start(io, &self.dialog.id, DialogTimer::Retransmit2xx, self.retransmit_2xx_interval);
        }
        self.timers
            .start(io, &self.dialog.id, DialogTimer::AckTimeout, self.settings.transaction_timeout());
        self.pending_2xx = Some(response);
    }

    pub fn is_waiting_for_ack(&self) -> bool {
        self.pending_2xx.is_some()
    }

    /// Handles the ACK for our 2xx. Returns `false` for an ACK that does
    /// not match the 2xx being retransmitted (a duplicate, typically).
    pub fn receive_ack(&mut self, ack: &Request, io: &mut dyn TransactionIo) -> DialogResult<bool> {
        let matches = self
            .pending_2xx
            .as_ref()
            .is_some_and(|r| r.cseq().seq == ack.cseq().seq);
        if !matches {
            return Ok(false);
        }
        self.pending_2xx = None;
        self.timers.stop(io, DialogTimer::Retransmit2xx);
        self.timers.stop(io, DialogTimer::AckTimeout);
        self.dialog.receive_request(ack)?;
        self.apply_request(ack, false)?;
        debug!(dialog = %self.dialog.id, "ACK received");
        Ok(true)
    }

    // ---- UAS: reliable provisionals ----------------------------------------

    pub fn has_unacknowledged_provisional(&self) -> bool {
        self.unacked_1xx.is_some()
    }

    /// Marks `response` reliable (`Require: 100rel` and the next `RSeq`) and
    /// starts its retransmission. Only one may be unacknowledged at a time.
    pub fn send_reliable_provisional(
        &mut self,
        mut response: Response,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Response> {
        if self.unacked_1xx.is_some() {
            return Err(DialogError::invalid_state(format!(
                "reliable provisional still unacknowledged in dialog {}",
                self.dialog.id
            )));
        }
        let rseq = self
            .local_rseq
            .map_or_else(|| rand::random::<u32>() % (1 << 31) + 1, |r| r + 1);
        self.local_rseq = Some(rseq);
        if !response.headers.has_option_tag(&HeaderName::Require, "100rel") {
            response.headers.append(HeaderName::Require, "100rel");
        }
        response.headers.set(HeaderName::RSeq, rseq.to_string());

        self.retransmit_1xx_interval = self.settings.t1;
        if !self.reliable_transport {
            self.timers
                .start(io, &self.dialog.id, DialogTimer::RetransmitReliable1xx, self.retransmit_1xx_interval);
        }
        self.timers
            .start(io, &self.dialog.id, DialogTimer::Reliable1xxTimeout, self.settings.transaction_timeout());
        debug!(dialog = %self.dialog.id, rseq, "Sending reliable {}", response.status);
        self.unacked_1xx = Some(response.clone());
        Ok(response)
    }

    /// Handles a PRACK. Returns `false` when its `RAck` does not match the
    /// outstanding reliable provisional (the caller answers 481).
    pub fn receive_prack(&mut self, prack: &Request, io: &mut dyn TransactionIo) -> DialogResult<bool> {
        let Some(unacked) = &self.unacked_1xx else {
            return Ok(false);
        };
        let expected = format!(
            "{} {} {}",
            unacked.headers.get(&HeaderName::RSeq).unwrap_or_default().trim(),
            unacked.cseq().seq,
            unacked.cseq().method
        );
        let rack = prack
            .headers
            .get(&HeaderName::RAck)
            .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" "));
        if rack.as_deref() != Some(expected.as_str()) {
            warn!(dialog = %self.dialog.id, ?rack, %expected, "PRACK does not match");
            return Ok(false);
        }
        self.dialog.receive_request(prack)?;
        self.unacked_1xx = None;
        self.timers.stop(io, DialogTimer::RetransmitReliable1xx);
        self.timers.stop(io, DialogTimer::Reliable1xxTimeout);
        self.apply_request(prack, false)?;
        Ok(true)
    }

    // ---- UAC: reliable provisionals ----------------------------------------

    /// Tracks the `RSeq` of an incoming reliable provisional. Returns
    /// `false` for a retransmission or one that arrived out of order, which
    /// the caller drops.
    pub fn receive_reliable_provisional(&mut self, response: &Response) -> bool {
        let Some(rseq) = response
            .headers
            .get(&HeaderName::RSeq)
            .and_then(|r| r.trim().parse::<u32>().ok())
        else {
            return true;
        };
        match self.remote_rseq {
            Some(last) if rseq != last.wrapping_add(1) => {
                debug!(dialog = %self.dialog.id, rseq, last, "Dropping reliable provisional");
                false
            }
            _ => {
                self.remote_rseq = Some(rseq);
                self.pending_rack = Some(format!("{} {} {}", rseq, response.cseq().seq, response.cseq().method));
                true
            }
        }
    }

    /// Whether a received reliable provisional still awaits our PRACK
    pub fn needs_prack(&self) -> bool {
        self.pending_rack.is_some()
    }

    /// PRACK for the last reliable provisional received
    pub fn create_prack(&mut self, options: &RequestOptions) -> DialogResult<Request> {
        let rack = self.pending_rack.clone().ok_or_else(|| {
            DialogError::invalid_state(format!("no reliable provisional to acknowledge in {}", self.dialog.id))
        })?;
        let mut options = options.clone();
        options.extra_headers.push((HeaderName::RAck, rack));
        let prack = self.create_request(Method::Prack, &options)?;
        self.pending_rack = None;
        Ok(prack)
    }

    // ---- timers and teardown -----------------------------------------------

    pub fn on_timer(&mut self, timer: DialogTimer, io: &mut dyn TransactionIo) -> SessionTimerOutcome {
        self.timers.fired(timer);
        match timer {
            DialogTimer::Retransmit2xx => {
                let Some(response) = &self.pending_2xx else {
                    return SessionTimerOutcome::Ignored;
                };
                io.send(Message::Response(response.clone()), None);
                self.retransmit_2xx_interval = self.settings.backoff(self.retransmit_2xx_interval);
                self.timers
                    .start(io, &self.dialog.id, DialogTimer::Retransmit2xx, self.retransmit_2xx_interval);
                SessionTimerOutcome::Retransmitted
            }
            DialogTimer::AckTimeout => {
                if self.pending_2xx.take().is_none() {
                    return SessionTimerOutcome::Ignored;
                }
                self.timers.stop(io, DialogTimer::Retransmit2xx);
                warn!(dialog = %self.dialog.id, "No ACK received for 2xx");
                SessionTimerOutcome::AckTimedOut
            }
            DialogTimer::RetransmitReliable1xx => {
                let Some(response) = &self.unacked_1xx else {
                    return SessionTimerOutcome::Ignored;
                };
                io.send(Message::Response(response.clone()), None);
                self.retransmit_1xx_interval *= 2;
                self.timers
                    .start(io, &self.dialog.id, DialogTimer::RetransmitReliable1xx, self.retransmit_1xx_interval);
                SessionTimerOutcome::Retransmitted
            }
            DialogTimer::Reliable1xxTimeout => {
                if self.unacked_1xx.take().is_none() {
                    return SessionTimerOutcome::Ignored;
                }
                self.timers.stop(io, DialogTimer::RetransmitReliable1xx);
                warn!(dialog = %self.dialog.id, "No PRACK received for reliable provisional");
                SessionTimerOutcome::PrackTimedOut
            }
            _ => SessionTimerOutcome::Ignored,
        }
    }

    /// Cancels every timer and closes the session
    pub fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.timers.stop_all(io);
        self.pending_2xx = None;
        self.unacked_1xx = None;
        self.signaling_state = SignalingState::Closed;
        self.dialog.terminate();
    }
}
