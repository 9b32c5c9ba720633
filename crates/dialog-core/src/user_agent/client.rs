//! User agent client: the TU side of one outgoing request
//!
//! A [`UserAgentClient`] owns the client transaction for its request, plus
//! the CANCEL transaction if the request was cancelled and, after a digest
//! challenge, both the replacement transaction and the challenged one. The
//! challenged transaction stays until Timer D (or K) so that retransmitted
//! 401/407 responses are still acknowledged. It turns transaction events into
//! [`ClientOutcome`]s for the user agent core, which owns dialogs.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use sipflow_sip_core::prelude::*;

use super::auth::authorization_for;
use crate::config::Credentials;
use crate::dialog::DialogId;
use crate::errors::{DialogError, DialogResult};
use crate::events::RejectCause;
use crate::transaction::timer::{TimerSettings, TimerType};
use crate::transaction::utils::create_cancel;
use crate::transaction::{ClientTransaction, Transaction, TransactionEvent, TransactionIo, TransactionKey};

/// Identifies an outgoing request for its whole life, across
/// authentication retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// What a response or timer meant for the request
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClientOutcome {
    /// 100 Trying
    Trying(Response),
    /// 101-199
    Progress(Response),
    /// 2xx, once per To-tag for a forked INVITE
    Accept(Response),
    /// 3xx
    Redirect(Response),
    Reject(RejectCause),
    /// The request was re-sent with credentials under `current`; `previous`
    /// only absorbs retransmissions of the challenge from now on
    AuthRetry {
        previous: TransactionKey,
        current: TransactionKey,
    },
}

/// Transport and timer parameters shared by every client transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientSettings {
    pub reliable: bool,
    pub timers: TimerSettings,
    pub max_forks: usize,
}

#[derive(Debug)]
pub struct UserAgentClient {
    id: ClientId,
    transaction: ClientTransaction,
    cancel_transaction: Option<ClientTransaction>,
    challenged: Option<ClientTransaction>,
    settings: ClientSettings,
    cancel_pending: bool,
    got_provisional: bool,
    final_received: bool,
    auth_attempted: bool,
    /// Dialog the request was sent in, if any
    pub(crate) dialog_id: Option<DialogId>,
    /// Sent by the core itself; outcomes are not reported to the application
    pub(crate) internal: bool,
    /// Dialogs created by 2xx responses to this INVITE, in arrival order
    pub(crate) forks: Vec<DialogId>,
    /// The fork the application acknowledged
    pub(crate) acked_fork: Option<DialogId>,
    /// ACKs sent to forks released by the core, re-sent when their 2xx is
    /// retransmitted
    pub(crate) released: HashMap<DialogId, Request>,
}

impl UserAgentClient {
    /// Wraps `request`, whose top Via already carries a fresh branch
    pub(crate) fn new(request: Request, settings: ClientSettings) -> DialogResult<Self> {
        let transaction = ClientTransaction::new(request, settings.reliable, settings.timers, settings.max_forks)?;
        Ok(Self {
            id: ClientId::new(),
            transaction,
            cancel_transaction: None,
            challenged: None,
            settings,
            cancel_pending: false,
            got_provisional: false,
            final_received: false,
            auth_attempted: false,
            dialog_id: None,
            internal: false,
            forks: Vec::new(),
            acked_fork: None,
            released: HashMap::new(),
        })
    }

    /// Sends the request
    pub(crate) fn start(&mut self, io: &mut dyn TransactionIo) -> DialogResult<()> {
        debug!(id = %self.id, tx = %self.transaction.key(), "Sending {}", self.transaction.request().method);
        self.transaction.start(io)?;
        Ok(())
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Key of the current (possibly re-authenticated) transaction
    pub fn key(&self) -> &TransactionKey {
        self.transaction.key()
    }

    pub fn cancel_key(&self) -> Option<&TransactionKey> {
        self.cancel_transaction.as_ref().map(|tx| tx.key())
    }

    /// Key of the transaction answered by the digest challenge, while it
    /// lingers
    pub fn challenged_key(&self) -> Option<&TransactionKey> {
        self.challenged.as_ref().map(|tx| tx.key())
    }

    fn challenged_mut(&mut self, key: &TransactionKey) -> Option<&mut ClientTransaction> {
        self.challenged.as_mut().filter(|tx| tx.key() == key)
    }

    fn drop_finished_challenge(&mut self) {
        if self.challenged.as_ref().is_some_and(|tx| tx.is_terminated()) {
            self.challenged = None;
        }
    }

    /// The request as last sent
    pub fn request(&self) -> &Request {
        self.transaction.request()
    }

    pub fn method(&self) -> &Method {
        &self.transaction.request().method
    }

    pub fn transaction(&self) -> &ClientTransaction {
        &self.transaction
    }

    pub(crate) fn transaction_mut(&mut self) -> &mut ClientTransaction {
        &mut self.transaction
    }

    pub fn has_final_response(&self) -> bool {
        self.final_received
    }

    /// Sends CANCEL (RFC 3261 §9.1). Deferred until a provisional response
    /// has arrived; a no-op once a final response has.
    pub(crate) fn cancel(&mut self, io: &mut dyn TransactionIo) -> DialogResult<()> {
        if *self.method() != Method::Invite {
            return Err(DialogError::invalid_state(format!("cannot cancel a {} request", self.method())));
        }
        if self.final_received || self.cancel_transaction.is_some() {
            debug!(id = %self.id, "CANCEL not needed");
            return Ok(());
        }
        if self.got_provisional {
            self.send_cancel(io)
        } else {
            debug!(id = %self.id, "Deferring CANCEL until a provisional response arrives");
            self.cancel_pending = true;
            Ok(())
        }
    }

    fn send_cancel(&mut self, io: &mut dyn TransactionIo) -> DialogResult<()> {
        self.cancel_pending = false;
        let cancel = create_cancel(self.transaction.request());
        let mut transaction = ClientTransaction::new(cancel, self.settings.reliable, self.settings.timers, 1)?;
        info!(id = %self.id, "Sending CANCEL");
        transaction.start(io)?;
        self.cancel_transaction = Some(transaction);
        Ok(())
    }

    /// Feeds a response matched to one of this client's transactions
    pub(crate) fn receive_response(
        &mut self,
        response: Response,
        credentials: Option<Credentials>,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Vec<ClientOutcome>> {
        if response.cseq().method == Method::Cancel {
            if let Some(cancel) = self.cancel_transaction.as_mut() {
                // The outcome shows up as 487 on the INVITE
                cancel.receive_response(response, io)?;
            }
            return Ok(Vec::new());
        }
        if let Some(key) = TransactionKey::from_response(&response) {
            if let Some(challenged) = self.challenged_mut(&key) {
                // Completed: the final response is re-ACKed, nothing reaches the TU
                challenged.receive_response(response, io)?;
                return Ok(Vec::new());
            }
            if key != *self.transaction.key() {
                debug!(id = %self.id, tx = %key, "Response for a finished transaction");
                return Ok(Vec::new());
            }
        }
        let events = self.transaction.receive_response(response, io)?;
        self.handle_events(events, credentials, io)
    }

    pub(crate) fn on_timer(
        &mut self,
        key: &TransactionKey,
        timer: TimerType,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Vec<ClientOutcome>> {
        if self.cancel_key() == Some(key) {
            if let Some(cancel) = self.cancel_transaction.as_mut() {
                cancel.on_timer(timer, io)?;
            }
            return Ok(Vec::new());
        }
        if let Some(challenged) = self.challenged_mut(key) {
            challenged.on_timer(timer, io)?;
            self.drop_finished_challenge();
            return Ok(Vec::new());
        }
        if key != self.transaction.key() {
            return Ok(Vec::new());
        }
        let events = self.transaction.on_timer(timer, io)?;
        self.handle_events(events, None, io)
    }

    pub(crate) fn on_transport_error(&mut self, key: &TransactionKey, io: &mut dyn TransactionIo) -> Vec<ClientOutcome> {
        if self.cancel_key() == Some(key) {
            if let Some(cancel) = self.cancel_transaction.as_mut() {
                cancel.on_transport_error(io);
            }
            return Vec::new();
        }
        if let Some(challenged) = self.challenged_mut(key) {
            challenged.on_transport_error(io);
            self.drop_finished_challenge();
            return Vec::new();
        }
        let events = self.transaction.on_transport_error(io);
        self.handle_events(events, None, io).unwrap_or_default()
    }

    fn handle_events(
        &mut self,
        events: Vec<TransactionEvent>,
        credentials: Option<Credentials>,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Vec<ClientOutcome>> {
        let mut outcomes = Vec::new();
        for event in events {
            match event {
                TransactionEvent::Response(response) => {
                    if let Some(outcome) = self.handle_response(response, credentials.as_ref(), io)? {
                        outcomes.push(outcome);
                    }
                }
                TransactionEvent::Timeout => {
                    self.final_received = true;
                    outcomes.push(ClientOutcome::Reject(RejectCause::Timeout));
                }
                TransactionEvent::TransportError => {
                    self.final_received = true;
                    outcomes.push(ClientOutcome::Reject(RejectCause::TransportError));
                }
                TransactionEvent::AckReceived(_) => {}
            }
        }
        Ok(outcomes)
    }

    fn handle_response(
        &mut self,
        response: Response,
        credentials: Option<&Credentials>,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Option<ClientOutcome>> {
        let status = response.status;
        if status.is_provisional() {
            self.got_provisional = true;
            if self.cancel_pending && !self.final_received {
                self.send_cancel(io)?;
            }
            return Ok(Some(if status == StatusCode::TRYING {
                ClientOutcome::Trying(response)
            } else {
                ClientOutcome::Progress(response)
            }));
        }

        self.final_received = true;
        self.cancel_pending = false;
        if status.is_success() {
            return Ok(Some(ClientOutcome::Accept(response)));
        }
        if status.is_redirection() {
            return Ok(Some(ClientOutcome::Redirect(response)));
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            && !self.auth_attempted
        {
            if let Some(outcome) = credentials.and_then(|c| self.retry_with_credentials(&response, c, io).transpose()) {
                return outcome.map(Some);
            }
        }
        Ok(Some(ClientOutcome::Reject(RejectCause::Response(response))))
    }

    // One retry per request: CSeq+1, new branch, same Call-ID and tags
    fn retry_with_credentials(
        &mut self,
        challenge: &Response,
        credentials: &Credentials,
        io: &mut dyn TransactionIo,
    ) -> DialogResult<Option<ClientOutcome>> {
        let previous_request = self.transaction.request();
        let Some((header, value)) = authorization_for(challenge, previous_request, credentials) else {
            return Ok(None);
        };
        let mut request = previous_request.clone();
        request.headers.other.remove(&HeaderName::Authorization);
        request.headers.other.remove(&HeaderName::ProxyAuthorization);
        request.headers.append(header, value);
        request.headers.cseq.seq += 1;
        if let Some(via) = request.headers.via.first_mut() {
            via.set_branch(generate_branch());
        }

        let mut transaction = ClientTransaction::new(request, self.settings.reliable, self.settings.timers, self.settings.max_forks)?;
        transaction.start(io)?;
        info!(id = %self.id, "Retrying {} with credentials", transaction.request().method);

        let previous = std::mem::replace(&mut self.transaction, transaction);
        let outcome = ClientOutcome::AuthRetry {
            previous: previous.key().clone(),
            current: self.transaction.key().clone(),
        };
        if !previous.is_terminated() {
            self.challenged = Some(previous);
        }
        self.auth_attempted = true;
        self.final_received = false;
        self.got_provisional = false;
        Ok(Some(outcome))
    }

    /// Whether every transaction of this client has terminated
    pub fn is_terminated(&self) -> bool {
        self.transaction.is_terminated()
            && self.cancel_transaction.as_ref().is_none_or(|tx| tx.is_terminated())
            && self.challenged.as_ref().is_none_or(|tx| tx.is_terminated())
    }

    pub(crate) fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.transaction.dispose(io);
        if let Some(cancel) = self.cancel_transaction.as_mut() {
            cancel.dispose(io);
        }
        if let Some(challenged) = self.challenged.as_mut() {
            challenged.dispose(io);
        }
    }
}
