//! Inbound request pipeline
//!
//! ```text
//!  request ─► mandatory headers ─► ACK ──────────► IST (Accepted) or dialog
//!                              ├─► CANCEL ───────► 200, then 487 on the INVITE
//!                              ├─► retransmission ► its server transaction
//!                              ├─► 405 / 416 / 404 / 400 / 420 / 482
//!                              ├─► To-tag ───────► dialog (or 481)
//!                              └─► no To-tag ────► out-of-dialog handling
//! ```
//!
//! Every rejection made before a server transaction exists is sent
//! statelessly.

use tracing::{debug, trace, warn};

use sipflow_sip_core::prelude::*;

use super::{DialogEntry, UserAgentCore, ACCEPTED_CONTENT, ALLOWED_METHODS};
use crate::dialog::{Dialog, DialogId, SubscriptionDialog, SubscriptionState};
use crate::errors::DialogError;
use crate::events::{TerminationReason, UserAgentEvent};
use crate::transaction::utils::create_response;
use crate::transaction::{ServerTransaction, TransactionEvent, TransactionIo, TransactionKey};
use crate::user_agent::{ResponseOptions, UserAgentServer};

/// Expiration assumed when a SUBSCRIBE or NOTIFY names none
pub(crate) const DEFAULT_SUBSCRIPTION_EXPIRES: u32 = 3600;

/// First token of an `Event` header, lowercased, without parameters
pub(crate) fn event_package(value: &str) -> String {
    value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

pub(crate) fn expires_header(headers: &MessageHeaders) -> Option<u32> {
    headers
        .get(&HeaderName::Expires)
        .and_then(|e| e.trim().parse().ok())
}

impl UserAgentCore {
    pub(super) fn receive_request(&mut self, request: Request) {
        debug!(method = %request.method, call_id = %request.call_id(), "Received request");
        if request.headers.via.is_empty() || request.call_id().is_empty() || request.from_tag().is_none() {
            warn!(call_id = %request.call_id(), "Dropping request missing Via, Call-ID or From-tag");
            return;
        }
        let Some(key) = TransactionKey::from_request(&request) else {
            self.reply_stateless(&request, StatusCode::BAD_REQUEST, Vec::new());
            return;
        };
        if request.cseq().method != request.method {
            self.reply_stateless(&request, StatusCode::BAD_REQUEST, Vec::new());
            return;
        }

        match request.method {
            Method::Ack => return self.receive_ack(&key, request),
            Method::Cancel => return self.receive_cancel(request),
            _ => {}
        }

        if let Some(server) = self.servers.get_mut(&key) {
            trace!(tx = %key, "Request retransmission");
            if let Err(e) = server.transaction_mut().receive_request(request, &mut self.io) {
                debug!(tx = %key, error = %e, "Retransmission refused");
            }
            return;
        }

        if let Some((status, headers)) = self.screen_request(&key, &request) {
            warn!(method = %request.method, uri = %request.uri, "Rejecting request with {}", status);
            self.reply_stateless(&request, status, headers);
            return;
        }

        if request.to_tag().is_some() {
            self.receive_in_dialog_request(request);
        } else {
            self.receive_out_of_dialog_request(request);
        }
    }

    /// Checks every new request must pass before a transaction is created
    fn screen_request(&self, key: &TransactionKey, request: &Request) -> Option<(StatusCode, Vec<(HeaderName, String)>)> {
        if !ALLOWED_METHODS.contains(&request.method) {
            return Some((
                StatusCode::METHOD_NOT_ALLOWED,
                vec![(HeaderName::Allow, Self::allow_value())],
            ));
        }
        if request.uri.scheme != Scheme::Sip {
            return Some((StatusCode::UNSUPPORTED_URI_SCHEME, Vec::new()));
        }
        let known_user = std::iter::once(&self.config.aor)
            .chain(self.config.contact.uris())
            .any(|uri| uri.user == request.uri.user);
        if !known_user {
            return Some((StatusCode::NOT_FOUND, Vec::new()));
        }
        if request.method == Method::Invite && request.headers.contact.is_empty() {
            return Some((StatusCode::BAD_REQUEST, Vec::new()));
        }
        let unsupported: Vec<String> = request
            .headers
            .tokens(&HeaderName::Require)
            .into_iter()
            .filter(|tag| !self.config.supports(tag))
            .collect();
        if !unsupported.is_empty() {
            return Some((
                StatusCode::BAD_EXTENSION,
                vec![(HeaderName::Unsupported, unsupported.join(", "))],
            ));
        }
        if request.to_tag().is_none() && self.is_merged(key, request) {
            return Some((StatusCode::LOOP_DETECTED, Vec::new()));
        }
        None
    }

    // Same From-tag, Call-ID and CSeq as a request we are already serving,
    // but arriving on another branch (RFC 3261 §8.2.2.2)
    fn is_merged(&self, key: &TransactionKey, request: &Request) -> bool {
        self.servers.values().any(|server| {
            let other = server.request();
            other.to_tag().is_none()
                && other.call_id() == request.call_id()
                && other.from_tag() == request.from_tag()
                && other.cseq() == request.cseq()
                && server.key().branch() != key.branch()
        })
    }

    fn new_server(&mut self, request: Request, dialog: Option<DialogId>) -> Option<TransactionKey> {
        let contact = self.contact();
        let server_header = self.config.user_agent_string.clone();
        match ServerTransaction::new(request, self.config.reliable_transport, self.config.timers, &mut self.io) {
            Ok(transaction) => {
                let mut server = UserAgentServer::new(transaction, contact, server_header);
                server.dialog_id = dialog;
                let key = server.key().clone();
                self.servers.insert(key.clone(), server);
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "Cannot create server transaction");
                None
            }
        }
    }

    /// Final response sent by the core itself rather than the application
    pub(super) fn respond_automatically(&mut self, key: &TransactionKey, status: StatusCode, options: ResponseOptions) {
        let Some(server) = self.servers.get_mut(key) else {
            return;
        };
        let code = status.as_u16();
        let result = if status.is_success() {
            server.accept(code, &options, &mut self.io)
        } else {
            server.reject(code, &options, &mut self.io)
        };
        if let Err(e) = result {
            debug!(tx = %key, error = %e, "Automatic {} not sent", status);
        }
        self.remove_terminated_server(key);
    }

    fn capability_headers(&self) -> ResponseOptions {
        ResponseOptions::new()
            .with_header(HeaderName::Allow, Self::allow_value())
            .with_header(HeaderName::Accept, ACCEPTED_CONTENT)
            .with_header(HeaderName::Supported, self.supported_value())
    }

    // ---- ACK and CANCEL --------------------------------------------------------

    fn receive_ack(&mut self, key: &TransactionKey, ack: Request) {
        let Some(server) = self.servers.get_mut(key) else {
            // ACK for a 2xx travels in its own transaction
            self.deliver_ack(ack);
            return;
        };
        match server.transaction_mut().receive_request(ack, &mut self.io) {
            Ok(events) => {
                for event in events {
                    if let TransactionEvent::AckReceived(ack) = event {
                        self.deliver_ack(ack);
                    }
                }
            }
            Err(e) => debug!(tx = %key, error = %e, "ACK refused"),
        }
        self.remove_terminated_server(key);
    }

    fn deliver_ack(&mut self, ack: Request) {
        let Some(id) = DialogId::from_incoming_request(&ack) else {
            trace!("Dropping ACK without tags");
            return;
        };
        let Some(session) = self.dialogs.get_mut(&id).and_then(DialogEntry::as_session_mut) else {
            trace!(dialog = %id, "Dropping ACK for unknown dialog");
            return;
        };
        match session.receive_ack(&ack, &mut self.io) {
            Ok(true) => self.emit(UserAgentEvent::AckReceived {
                dialog: id,
                request: ack,
            }),
            Ok(false) => trace!(dialog = %id, "Absorbing ACK retransmission"),
            Err(e) => warn!(dialog = %id, error = %e, "ACK refused"),
        }
    }

    /// CANCEL (RFC 3261 §9.2): 200 for the CANCEL itself, then 487 for the
    /// INVITE if it is still unanswered
    fn receive_cancel(&mut self, cancel: Request) {
        let branch = cancel.branch().unwrap_or_default();
        let target = self
            .servers
            .keys()
            .find(|k| k.branch() == branch && *k.method() != Method::Cancel)
            .cloned();
        let Some(target) = target else {
            debug!(branch, "CANCEL matches no transaction");
            self.reply_stateless(&cancel, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, Vec::new());
            return;
        };
        let Some(server) = self.servers.get(&target) else {
            return;
        };
        let mut ok = create_response(&cancel, StatusCode::OK, Some(server.local_tag()));
        ok.headers
            .set(HeaderName::Server, self.config.user_agent_string.clone());
        let pending = server.is_pending();
        let request = server.request().clone();
        let dialog = server.dialog_id.clone();
        self.io.send(ok.into(), None);

        if !pending || *target.method() != Method::Invite {
            debug!(tx = %target, "CANCEL has nothing left to cancel");
            return;
        }
        self.respond_automatically(&target, StatusCode::REQUEST_TERMINATED, ResponseOptions::default());
        self.emit(UserAgentEvent::Cancelled {
            server: target,
            request,
        });
        if let Some(dialog) = dialog {
            self.unwind_server_dialog(&Method::Invite, &dialog);
        }
    }

    // ---- inside a dialog -------------------------------------------------------

    fn receive_in_dialog_request(&mut self, request: Request) {
        if request.method == Method::Options {
            let headers = self.capability_headers().extra_headers;
            self.reply_stateless(&request, StatusCode::OK, headers);
            return;
        }
        let Some(id) = DialogId::from_incoming_request(&request) else {
            self.reply_stateless(&request, StatusCode::BAD_REQUEST, Vec::new());
            return;
        };
        let mut created = false;
        if !self.dialogs.contains_key(&id) {
            created = request.method == Method::Notify && self.create_subscription_from_notify(&id, &request);
            if !created {
                debug!(dialog = %id, method = %request.method, "Request for unknown dialog");
                self.reply_stateless(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, Vec::new());
                return;
            }
        }
        if !created {
            let ordered = self
                .dialogs
                .get(&id)
                .map(|entry| entry.dialog().sequence_guard(&request));
            if let Some(Err(e)) = ordered {
                debug!(dialog = %id, error = %e, "Refusing out-of-order request");
                self.reply_stateless(&request, StatusCode::SERVER_INTERNAL_ERROR, Vec::new());
                return;
            }
        }

        let Some(key) = self.new_server(request.clone(), Some(id.clone())) else {
            return;
        };
        match request.method {
            Method::Bye => self.receive_bye(&id, &key, &request),
            Method::Prack => self.receive_prack(&id, &key, request),
            Method::Notify if self.subscription(&id).is_some() => self.receive_notify(&id, &key, request),
            _ => self.receive_dialog_request(&id, &key, request),
        }
    }

    /// RFC 6665 §4.1.2.4: a NOTIFY may arrive before the 2xx to our
    /// SUBSCRIBE, and creates the dialog
    fn create_subscription_from_notify(&mut self, id: &DialogId, notify: &Request) -> bool {
        let pending = (notify.call_id().to_string(), id.local_tag.clone());
        let Some(&client_id) = self.pending_subscriptions.get(&pending) else {
            return false;
        };
        let contact = self.contact();
        let timers = self.config.timers;
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        let subscribe = client.request();
        let event = subscribe.headers.get(&HeaderName::Event).unwrap_or_default().to_string();
        let notify_event = notify.headers.get(&HeaderName::Event).unwrap_or_default();
        if event_package(&event) != event_package(notify_event) {
            debug!(dialog = %id, %event, notify_event, "NOTIFY for another event package");
            return false;
        }
        let expires = expires_header(&subscribe.headers).unwrap_or(DEFAULT_SUBSCRIPTION_EXPIRES);
        let dialog = match Dialog::new_from_notify(subscribe, notify, contact) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(dialog = %id, error = %e, "Cannot create subscription from NOTIFY");
                return false;
            }
        };
        client.forks.push(id.clone());
        let subscription = SubscriptionDialog::new_subscriber(dialog, event, expires, timers);
        self.dialogs
            .insert(id.clone(), DialogEntry::Subscription(subscription));
        true
    }

    fn receive_bye(&mut self, id: &DialogId, key: &TransactionKey, request: &Request) {
        if let Some(entry) = self.dialogs.get_mut(id) {
            if let Err(e) = entry.dialog_mut().receive_request(request) {
                debug!(dialog = %id, error = %e, "BYE not recorded");
            }
        }
        self.respond_automatically(key, StatusCode::OK, ResponseOptions::default());

        // Requests still open inside the dialog end with it
        let open: Vec<TransactionKey> = self
            .servers
            .iter()
            .filter(|(k, s)| *k != key && s.dialog_id.as_ref() == Some(id) && s.is_pending())
            .map(|(k, _)| k.clone())
            .collect();
        for open_key in open {
            self.respond_automatically(&open_key, StatusCode::REQUEST_TERMINATED, ResponseOptions::default());
        }
        self.terminate_dialog(id, TerminationReason::RemoteBye);
    }

    fn receive_prack(&mut self, id: &DialogId, key: &TransactionKey, request: Request) {
        let result = match self.dialogs.get_mut(id).and_then(DialogEntry::as_session_mut) {
            Some(session) => session.receive_prack(&request, &mut self.io),
            None => Ok(false),
        };
        match result {
            Ok(true) => {
                self.respond_automatically(key, StatusCode::OK, ResponseOptions::default());
                self.emit(UserAgentEvent::PrackReceived {
                    dialog: id.clone(),
                    request,
                });
            }
            Ok(false) => {
                self.respond_automatically(key, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, ResponseOptions::default())
            }
            Err(e) => {
                warn!(dialog = %id, error = %e, "PRACK refused");
                self.respond_automatically(key, StatusCode::SERVER_INTERNAL_ERROR, ResponseOptions::default());
            }
        }
    }

    fn receive_notify(&mut self, id: &DialogId, key: &TransactionKey, request: Request) {
        let result = match self.dialogs.get_mut(id).and_then(DialogEntry::as_subscription_mut) {
            Some(subscription) => subscription.receive_notify(&request, &mut self.io),
            None => return,
        };
        match result {
            Ok(state) => {
                self.respond_automatically(key, StatusCode::OK, ResponseOptions::default());
                self.emit(UserAgentEvent::SubscriptionStateChanged {
                    dialog: id.clone(),
                    state,
                    request,
                });
                if state == SubscriptionState::Terminated {
                    self.terminate_dialog(id, TerminationReason::SubscriptionEnded);
                }
            }
            Err(DialogError::OutOfOrder { .. }) => {
                self.respond_automatically(key, StatusCode::SERVER_INTERNAL_ERROR, ResponseOptions::default())
            }
            Err(e) => {
                warn!(dialog = %id, error = %e, "Malformed NOTIFY");
                self.respond_automatically(key, StatusCode::BAD_REQUEST, ResponseOptions::default());
            }
        }
    }

    /// Re-INVITE, UPDATE and every other in-dialog request the
    /// application answers
    fn receive_dialog_request(&mut self, id: &DialogId, key: &TransactionKey, request: Request) {
        let result = match self.dialogs.get_mut(id) {
            Some(DialogEntry::Session(session)) => session.receive_request(&request),
            Some(DialogEntry::Subscription(subscription)) => subscription.dialog_mut().receive_request(&request),
            None => return,
        };
        match result {
            Ok(()) => self.emit(UserAgentEvent::DialogRequest {
                dialog: id.clone(),
                server: key.clone(),
                request,
            }),
            Err(DialogError::OfferConflict { status, message }) => {
                debug!(dialog = %id, %message, "Refusing offer with {}", status);
                let mut options = ResponseOptions::default();
                if status == StatusCode::SERVER_INTERNAL_ERROR {
                    let retry_after = rand::random::<u32>() % 11;
                    options = options.with_header(HeaderName::RetryAfter, retry_after.to_string());
                }
                self.respond_automatically(key, status, options);
            }
            Err(e) => {
                warn!(dialog = %id, error = %e, "In-dialog request refused");
                self.respond_automatically(key, StatusCode::SERVER_INTERNAL_ERROR, ResponseOptions::default());
            }
        }
    }

    // ---- outside a dialog ------------------------------------------------------

    fn receive_out_of_dialog_request(&mut self, request: Request) {
        match request.method {
            Method::Bye | Method::Prack | Method::Update => {
                self.reply_stateless(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, Vec::new());
            }
            Method::Info => {
                self.reply_stateless(
                    &request,
                    StatusCode::METHOD_NOT_ALLOWED,
                    vec![(HeaderName::Allow, Self::allow_value())],
                );
            }
            Method::Options => {
                if let Some(key) = self.new_server(request, None) {
                    let options = self.capability_headers();
                    self.respond_automatically(&key, StatusCode::OK, options);
                }
            }
            Method::Invite
            | Method::Message
            | Method::Notify
            | Method::Refer
            | Method::Register
            | Method::Subscribe => {
                let method = request.method.clone();
                let Some(server) = self.new_server(request.clone(), None) else {
                    return;
                };
                let event = match method {
                    Method::Invite => UserAgentEvent::Invite { server, request },
                    Method::Message => UserAgentEvent::Message { server, request },
                    Method::Notify => UserAgentEvent::Notify { server, request },
                    Method::Refer => UserAgentEvent::Refer { server, request },
                    Method::Register => UserAgentEvent::Register { server, request },
                    _ => UserAgentEvent::Subscribe { server, request },
                };
                self.emit(event);
            }
            _ => trace!(method = %request.method, "Dropping out-of-dialog request"),
        }
    }
}
