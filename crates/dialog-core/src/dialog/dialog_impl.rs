//! Dialog implementation for RFC 3261 SIP dialogs
//!
//! This module contains the main Dialog struct: creation from the request
//! and response that establish it, CSeq ordering of incoming requests, the
//! route set, and construction of in-dialog requests.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sipflow_sip_core::prelude::*;

use super::dialog_id::DialogId;
use crate::errors::{DialogError, DialogResult};
use crate::transaction::utils::request_builders::MAX_FORWARDS;
use crate::user_agent::options::RequestOptions;

/// Dialog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Established by a provisional response carrying a To-tag
    Early,
    Confirmed,
    Terminated,
}

/// A SIP dialog as defined in RFC 3261 §12
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    /// Unique identifier for this dialog
    pub id: DialogId,

    /// Current state of the dialog
    pub state: DialogState,

    /// Local sequence number, unset until we send a request
    pub local_seq: Option<u32>,

    /// Remote sequence number, unset until the peer sends a request
    pub remote_seq: Option<u32>,

    /// Local URI, carrying the local tag
    pub local_uri: NameAddr,

    /// Remote URI, carrying the remote tag
    pub remote_uri: NameAddr,

    /// Where in-dialog requests are sent (the peer's Contact)
    pub remote_target: Uri,

    /// Route set, in the order it is applied to outgoing requests
    pub route_set: Vec<NameAddr>,

    /// Established over SIPS
    pub secure: bool,

    /// Whether this dialog was created by local UA (true) or remote UA (false)
    pub is_initiator: bool,

    /// CSeq number of the latest INVITE, reused by its ACK and CANCEL
    pub invite_seq: u32,

    /// Contact we advertise in in-dialog requests
    pub local_contact: NameAddr,
}

fn first_contact(headers: &MessageHeaders) -> Option<Uri> {
    headers.contact.first().map(|c| c.uri.clone())
}

impl Dialog {
    /// UAC side: dialog established by `response` (1xx with To-tag, or 2xx)
    /// to our `request` (RFC 3261 §12.1.2)
    pub fn new_uac(request: &Request, response: &Response, local_contact: NameAddr) -> DialogResult<Self> {
        let local_tag = request
            .from_tag()
            .ok_or_else(|| DialogError::protocol_error("request has no From-tag"))?;
        let remote_tag = response
            .to_tag()
            .ok_or_else(|| DialogError::protocol_error("response establishing a dialog has no To-tag"))?;
        let remote_target = match first_contact(&response.headers) {
            Some(uri) => uri,
            None if response.status.is_provisional() => request.uri.clone(),
            None => return Err(DialogError::protocol_error("2xx establishing a dialog has no Contact")),
        };

        let id = DialogId::new(request.call_id(), local_tag, remote_tag);
        let state = if response.status.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };
        debug!(dialog = %id, ?state, "Creating UAC dialog");

        Ok(Self {
            id,
            state,
            local_seq: Some(request.cseq().seq),
            remote_seq: None,
            local_uri: request.headers.from.clone(),
            remote_uri: response.headers.to.clone(),
            remote_target,
            route_set: response.headers.record_route.iter().rev().cloned().collect(),
            secure: request.uri.is_secure(),
            is_initiator: true,
            invite_seq: request.cseq().seq,
            local_contact,
        })
    }

    /// UAS side: dialog for `request`, answered with `local_tag` (RFC 3261 §12.1.1).
    ///
    /// Starts Early; the UAS confirms it when it sends a 2xx.
    pub fn new_uas(request: &Request, local_tag: &str, local_contact: NameAddr) -> DialogResult<Self> {
        let remote_tag = request
            .from_tag()
            .ok_or_else(|| DialogError::protocol_error("request has no From-tag"))?;
        let remote_target = first_contact(&request.headers)
            .ok_or_else(|| DialogError::protocol_error("dialog-creating request has no Contact"))?;

        let id = DialogId::new(request.call_id(), local_tag, remote_tag);
        debug!(dialog = %id, "Creating UAS dialog");

        let mut local_uri = request.headers.to.clone();
        local_uri.set_tag(local_tag);
        Ok(Self {
            id,
            state: DialogState::Early,
            local_seq: None,
            remote_seq: Some(request.cseq().seq),
            local_uri,
            remote_uri: request.headers.from.clone(),
            remote_target,
            route_set: request.headers.record_route.clone(),
            secure: request.uri.is_secure(),
            is_initiator: false,
            invite_seq: request.cseq().seq,
            local_contact,
        })
    }

    /// Subscriber side: dialog created by a NOTIFY for our SUBSCRIBE
    /// (RFC 6665 §4.1.2.4). The NOTIFY is a request to us, so its
    /// Record-Route is taken in order.
    pub fn new_from_notify(subscribe: &Request, notify: &Request, local_contact: NameAddr) -> DialogResult<Self> {
        let local_tag = subscribe
            .from_tag()
            .ok_or_else(|| DialogError::protocol_error("SUBSCRIBE has no From-tag"))?;
        let remote_tag = notify
            .from_tag()
            .ok_or_else(|| DialogError::protocol_error("NOTIFY has no From-tag"))?;
        let remote_target = first_contact(&notify.headers)
            .ok_or_else(|| DialogError::protocol_error("NOTIFY has no Contact"))?;

        let id = DialogId::new(subscribe.call_id(), local_tag, remote_tag);
        debug!(dialog = %id, "Creating subscription dialog from NOTIFY");
        Ok(Self {
            id,
            state: DialogState::Confirmed,
            local_seq: Some(subscribe.cseq().seq),
            remote_seq: Some(notify.cseq().seq),
            local_uri: subscribe.headers.from.clone(),
            remote_uri: notify.headers.from.clone(),
            remote_target,
            route_set: notify.headers.record_route.clone(),
            secure: subscribe.uri.is_secure(),
            is_initiator: true,
            invite_seq: subscribe.cseq().seq,
            local_contact,
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn is_early(&self) -> bool {
        self.state == DialogState::Early
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Early -> Confirmed
    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            debug!(dialog = %self.id, "Dialog confirmed");
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        if self.state != DialogState::Terminated {
            debug!(dialog = %self.id, "Dialog terminated");
            self.state = DialogState::Terminated;
        }
    }

    /// Request-URI and Route headers per RFC 3261 §12.2.1.1
    pub fn request_target(&self) -> (Uri, Vec<NameAddr>) {
        match self.route_set.first() {
            None => (self.remote_target.clone(), Vec::new()),
            Some(first) if first.uri.is_loose_router() => (self.remote_target.clone(), self.route_set.clone()),
            Some(first) => {
                // Strict router: it becomes the Request-URI and the remote
                // target goes last in the Route set
                let mut route: Vec<NameAddr> = self.route_set[1..].to_vec();
                route.push(NameAddr::new(self.remote_target.clone()));
                (first.uri.to_request_uri(), route)
            }
        }
    }

    /// Builds an in-dialog request (RFC 3261 §12.2.1.1).
    ///
    /// The local CSeq is incremented (or initialised) except for ACK and
    /// CANCEL, which reuse the CSeq number of the INVITE. The Via is left
    /// to the client transaction.
    pub fn create_outgoing_request_message(&mut self, method: Method, options: &RequestOptions) -> DialogResult<Request> {
        if self.is_terminated() {
            return Err(DialogError::invalid_state(format!(
                "cannot send {} in terminated dialog {}",
                method, self.id
            )));
        }
        let seq = match method {
            Method::Ack | Method::Cancel => self.invite_seq,
            _ => {
                let next = self.local_seq.map_or_else(|| rand::random::<u16>() as u32 + 1, |s| s + 1);
                self.local_seq = Some(next);
                if method == Method::Invite {
                    self.invite_seq = next;
                }
                next
            }
        };

        let (request_uri, route) = self.request_target();
        let mut headers = MessageHeaders::new(
            self.local_uri.clone(),
            self.remote_uri.clone(),
            self.id.call_id.clone(),
            CSeq::new(seq, method.clone()),
        );
        headers.route = route;
        if !matches!(method, Method::Ack | Method::Cancel | Method::Bye) {
            headers.contact.push(self.local_contact.clone());
        }
        headers.set(HeaderName::MaxForwards, MAX_FORWARDS);

        let mut request = Request::new(method, request_uri, headers);
        options.apply(&mut request);
        Ok(request)
    }

    /// Fails with [`DialogError::OutOfOrder`] when `request` is not above
    /// the remote CSeq. ACK and CANCEL are exempt.
    pub fn sequence_guard(&self, request: &Request) -> DialogResult<()> {
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Ok(());
        }
        let received = request.cseq().seq;
        match self.remote_seq {
            Some(current) if received <= current => {
                warn!(dialog = %self.id, received, current, "Out-of-order {} request", request.method);
                Err(DialogError::OutOfOrder {
                    dialog: self.id.clone(),
                    received,
                    current,
                })
            }
            _ => Ok(()),
        }
    }

    /// Accepts an in-dialog request: CSeq check, then remote CSeq update
    /// and target refresh. Nothing changes when the check fails.
    pub fn receive_request(&mut self, request: &Request) -> DialogResult<()> {
        self.advance_remote_seq(request)?;
        self.refresh_target_from_request(request);
        Ok(())
    }

    /// The CSeq half of [`receive_request`](Self::receive_request). A request
    /// refused after this point has still used up its sequence number.
    pub fn advance_remote_seq(&mut self, request: &Request) -> DialogResult<()> {
        self.sequence_guard(request)?;
        if !matches!(request.method, Method::Ack | Method::Cancel) {
            self.remote_seq = Some(request.cseq().seq);
        }
        Ok(())
    }

    pub(crate) fn refresh_target_from_request(&mut self, request: &Request) {
        if is_target_refresh(&request.method) {
            if let Some(target) = first_contact(&request.headers) {
                self.remote_target = target;
            }
        }
    }

    /// When a 2xx confirms an early dialog: route set from its Record-Route,
    /// reversed, on the UAC side. The remote target is left to
    /// [`refresh_target`](Self::refresh_target).
    pub fn recompute_route_set(&mut self, response: &Response) {
        if !self.is_initiator {
            return;
        }
        self.route_set = response.headers.record_route.iter().rev().cloned().collect();
    }

    /// Target refresh from a 2xx to an in-dialog re-INVITE, UPDATE or SUBSCRIBE
    pub fn refresh_target(&mut self, response: &Response) {
        if response.status.is_success() && is_target_refresh(&response.cseq().method) {
            if let Some(target) = first_contact(&response.headers) {
                self.remote_target = target;
            }
        }
    }
}

fn is_target_refresh(method: &Method) -> bool {
    matches!(
        method,
        Method::Invite | Method::Update | Method::Subscribe | Method::Notify
    )
}
