//! # User agent core
//!
//! [`UserAgentCore`] is the top-level router of a user agent. It owns every
//! client and server transaction user, every dialog and every pending
//! subscription, keyed by [`ClientId`], [`TransactionKey`] and [`DialogId`].
//!
//! ```text
//!                  receive_bytes / receive_message
//!                                │
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!           request pipeline              response matching
//!        (requests.rs, §8.2 checks)     (responses.rs, branch+method)
//!                 │                             │
//!        UserAgentServer ◄──┐         ┌──► UserAgentClient
//!                 │         │         │         │
//!                 ▼         │         │         ▼
//!           SessionDialog / SubscriptionDialog (dialogs map)
//!                                │
//!          fire_timers ──────────┤ (timers.rs)
//!                                ▼
//!            outbox (take_outgoing) + events (poll_event)
//! ```
//!
//! The core is synchronous and never blocks: every entry point runs to
//! completion, queueing outgoing messages in its [`IoContext`] and
//! application notifications as [`UserAgentEvent`]s. The
//! [`UserAgent`](crate::runner::UserAgent) runner drives it from tokio.
//!
//! Application operations (sending requests, answering incoming ones,
//! dialog requests) live in `operations.rs`.

mod operations;
mod requests;
mod responses;
mod timers;

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use sipflow_sip_core::prelude::*;

use crate::config::UserAgentCoreConfig;
use crate::dialog::{Dialog, DialogId, SessionDialog, SubscriptionDialog};
use crate::errors::{DialogError, DialogResult};
use crate::events::{TerminationReason, UserAgentEvent};
use crate::transaction::utils::create_stateless_response;
use crate::transaction::{IoContext, Outgoing, Transaction, TransactionIo, TransactionKey};
use crate::user_agent::client::ClientSettings;
use crate::user_agent::{ClientId, UserAgentClient, UserAgentServer};

/// Methods this user agent understands, as advertised in `Allow`
pub const ALLOWED_METHODS: [Method; 13] = [
    Method::Invite,
    Method::Ack,
    Method::Cancel,
    Method::Bye,
    Method::Options,
    Method::Message,
    Method::Notify,
    Method::Subscribe,
    Method::Refer,
    Method::Register,
    Method::Prack,
    Method::Update,
    Method::Info,
];

/// Body types we accept, as advertised in `Accept`
pub const ACCEPTED_CONTENT: &str = "application/sdp";

/// A dialog usage owned by the core
#[derive(Debug)]
pub enum DialogEntry {
    Session(SessionDialog),
    Subscription(SubscriptionDialog),
}

impl DialogEntry {
    pub fn id(&self) -> &DialogId {
        &self.dialog().id
    }

    pub fn dialog(&self) -> &Dialog {
        match self {
            DialogEntry::Session(session) => session.dialog(),
            DialogEntry::Subscription(subscription) => subscription.dialog(),
        }
    }

    pub fn dialog_mut(&mut self) -> &mut Dialog {
        match self {
            DialogEntry::Session(session) => session.dialog_mut(),
            DialogEntry::Subscription(subscription) => subscription.dialog_mut(),
        }
    }

    pub fn as_session(&self) -> Option<&SessionDialog> {
        match self {
            DialogEntry::Session(session) => Some(session),
            DialogEntry::Subscription(_) => None,
        }
    }

    pub fn as_session_mut(&mut self) -> Option<&mut SessionDialog> {
        match self {
            DialogEntry::Session(session) => Some(session),
            DialogEntry::Subscription(_) => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&SubscriptionDialog> {
        match self {
            DialogEntry::Subscription(subscription) => Some(subscription),
            DialogEntry::Session(_) => None,
        }
    }

    pub fn as_subscription_mut(&mut self) -> Option<&mut SubscriptionDialog> {
        match self {
            DialogEntry::Subscription(subscription) => Some(subscription),
            DialogEntry::Session(_) => None,
        }
    }

    fn dispose(&mut self, io: &mut dyn TransactionIo) {
        match self {
            DialogEntry::Session(session) => session.dispose(io),
            DialogEntry::Subscription(subscription) => subscription.dispose(io),
        }
    }
}

/// Router between the network, the transaction users, the dialogs and
/// the application
#[derive(Debug)]
pub struct UserAgentCore {
    config: UserAgentCoreConfig,
    io: IoContext,
    clients: HashMap<ClientId, UserAgentClient>,
    /// Every live client transaction (including CANCEL) to its client
    client_index: HashMap<TransactionKey, ClientId>,
    servers: HashMap<TransactionKey, UserAgentServer>,
    dialogs: HashMap<DialogId, DialogEntry>,
    /// Out-of-dialog SUBSCRIBEs by (Call-ID, From-tag), so that a NOTIFY
    /// arriving before the 2xx can create the dialog
    pending_subscriptions: HashMap<(String, String), ClientId>,
    events: VecDeque<UserAgentEvent>,
}

impl UserAgentCore {
    pub fn new(config: UserAgentCoreConfig) -> DialogResult<Self> {
        config.validate()?;
        info!(aor = %config.aor, contact = %config.contact.uri, "Creating user agent core");
        Ok(Self {
            config,
            io: IoContext::new(),
            clients: HashMap::new(),
            client_index: HashMap::new(),
            servers: HashMap::new(),
            dialogs: HashMap::new(),
            pending_subscriptions: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &UserAgentCoreConfig {
        &self.config
    }

    // ---- input ---------------------------------------------------------------

    /// Parses and routes one datagram or stream frame. Malformed input is
    /// dropped without a response.
    pub fn receive_bytes(&mut self, data: &[u8]) {
        match parse_message(data) {
            Ok(message) => self.receive_message(message),
            Err(e) => warn!(error = %e, "Dropping malformed message"),
        }
    }

    pub fn receive_message(&mut self, message: Message) {
        match message {
            Message::Request(request) => self.receive_request(request),
            Message::Response(response) => self.receive_response(response),
        }
    }

    /// A send queued by `origin` failed. The owning transaction terminates
    /// and its user sees a transport error (`Outgoing` with a `Reject` for a
    /// client, `ServerFailed` for a server); nothing is retried.
    pub fn transport_error(&mut self, origin: Option<&TransactionKey>) {
        let Some(key) = origin else {
            return;
        };
        error!(tx = %key, "Transport error");
        if key.is_server() {
            let failed = self.servers.get_mut(key).and_then(|server| {
                let events = server.transaction_mut().on_transport_error(&mut self.io);
                (!events.is_empty()).then(|| (server.request().clone(), server.dialog_id.clone()))
            });
            if let Some((request, dialog)) = failed {
                let method = request.method.clone();
                self.emit(UserAgentEvent::ServerFailed {
                    server: key.clone(),
                    request,
                });
                if let Some(dialog) = dialog {
                    self.unwind_server_dialog(&method, &dialog);
                }
            }
            self.remove_terminated_server(key);
            return;
        }
        let Some(&id) = self.client_index.get(key) else {
            return;
        };
        let outcomes = match self.clients.get_mut(&id) {
            Some(client) => client.on_transport_error(key, &mut self.io),
            None => return,
        };
        self.handle_client_outcomes(id, outcomes);
    }

    // ---- clock ---------------------------------------------------------------

    /// Reference time for timers started by the next operations
    pub fn set_now(&mut self, now: Instant) {
        self.io.set_now(now);
    }

    pub fn now(&self) -> Instant {
        self.io.now()
    }

    /// Earliest pending timer, for the runner to sleep until
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.io.scheduler().next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.io.scheduler().len()
    }

    // ---- output --------------------------------------------------------------

    /// Drains the messages queued for the transport, oldest first
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.io.take_outgoing()
    }

    pub fn poll_event(&mut self) -> Option<UserAgentEvent> {
        self.events.pop_front()
    }

    pub fn take_events(&mut self) -> Vec<UserAgentEvent> {
        self.events.drain(..).collect()
    }

    // ---- queries -------------------------------------------------------------

    pub fn dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id).map(DialogEntry::dialog)
    }

    pub fn dialog_entry(&self, id: &DialogId) -> Option<&DialogEntry> {
        self.dialogs.get(id)
    }

    pub fn session(&self, id: &DialogId) -> Option<&SessionDialog> {
        self.dialogs.get(id).and_then(DialogEntry::as_session)
    }

    pub fn subscription(&self, id: &DialogId) -> Option<&SubscriptionDialog> {
        self.dialogs.get(id).and_then(DialogEntry::as_subscription)
    }

    pub fn dialog_ids(&self) -> impl Iterator<Item = &DialogId> {
        self.dialogs.keys()
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn client(&self, id: &ClientId) -> Option<&UserAgentClient> {
        self.clients.get(id)
    }

    pub fn server(&self, key: &TransactionKey) -> Option<&UserAgentServer> {
        self.servers.get(key)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    // ---- helpers shared by the submodules ------------------------------------

    fn emit(&mut self, event: UserAgentEvent) {
        trace!(?event, "Queueing user agent event");
        self.events.push_back(event);
    }

    fn contact(&self) -> NameAddr {
        NameAddr::new(self.config.contact.uri.clone())
    }

    fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            reliable: self.config.reliable_transport,
            timers: self.config.timers,
            max_forks: self.config.max_forks,
        }
    }

    /// Top Via for a request we originate, with a fresh branch
    fn new_via(&self) -> Via {
        let via_host = self.config.via_host.as_str();
        let (host, port) = match via_host.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (via_host, None),
            },
            _ => (via_host, None),
        };
        Via::new(self.config.via_transport.clone(), host, port, generate_branch())
    }

    fn allow_value() -> String {
        ALLOWED_METHODS.iter().map(Method::as_str).collect::<Vec<_>>().join(", ")
    }

    fn supported_value(&self) -> String {
        self.config.supported_option_tags.join(", ")
    }

    /// Starts a client for `request`, stamping our Via on it
    fn start_client(&mut self, mut request: Request, dialog: Option<DialogId>, internal: bool) -> DialogResult<ClientId> {
        request.headers.via.insert(0, self.new_via());
        if request.headers.get(&HeaderName::UserAgent).is_none() {
            request
                .headers
                .set(HeaderName::UserAgent, self.config.user_agent_string.clone());
        }
        let mut client = UserAgentClient::new(request, self.client_settings())?;
        client.dialog_id = dialog;
        client.internal = internal;
        client.start(&mut self.io)?;
        let id = client.id();
        self.client_index.insert(client.key().clone(), id);
        self.clients.insert(id, client);
        Ok(id)
    }

    /// Keeps `client_index` in step with the client's live transactions
    fn index_client(&mut self, id: ClientId) {
        if let Some(client) = self.clients.get(&id) {
            self.client_index.insert(client.key().clone(), id);
            if let Some(cancel) = client.cancel_key() {
                self.client_index.insert(cancel.clone(), id);
            }
        }
    }

    /// Answers `request` outside any transaction
    fn reply_stateless(&mut self, request: &Request, status: StatusCode, headers: Vec<(HeaderName, String)>) {
        let mut response = create_stateless_response(request, status);
        response
            .headers
            .set(HeaderName::Server, self.config.user_agent_string.clone());
        for (name, value) in headers {
            response.headers.append(name, value);
        }
        debug!(call_id = %request.call_id(), "Replying {} to {} statelessly", status, request.method);
        self.io.send(response.into(), None);
    }

    /// Disposes and forgets a dialog, telling the application why
    fn terminate_dialog(&mut self, id: &DialogId, reason: TerminationReason) {
        let Some(mut entry) = self.dialogs.remove(id) else {
            return;
        };
        entry.dispose(&mut self.io);
        info!(dialog = %id, ?reason, "Dialog terminated");
        self.emit(UserAgentEvent::DialogTerminated {
            dialog: id.clone(),
            reason,
        });
    }

    fn remove_terminated_server(&mut self, key: &TransactionKey) {
        if self.servers.get(key).is_some_and(UserAgentServer::is_terminated) {
            trace!(tx = %key, "Removing terminated server transaction");
            self.servers.remove(key);
        }
    }

    fn lookup_dialog_mut(&mut self, id: &DialogId) -> DialogResult<&mut DialogEntry> {
        self.dialogs
            .get_mut(id)
            .ok_or_else(|| DialogError::not_found("dialog", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserAgentCoreConfig;

    fn core() -> UserAgentCore {
        let config = UserAgentCoreConfig::builder(
            "sip:alice@atlanta.example.com".parse().unwrap(),
            "sip:alice@192.0.2.1:5060".parse().unwrap(),
        )
        .build()
        .unwrap();
        UserAgentCore::new(config).unwrap()
    }

    #[test]
    fn test_via_carries_configured_host_and_port() {
        let core = core();
        let via = core.new_via();
        assert_eq!(via.host, "192.0.2.1");
        assert_eq!(via.port, Some(5060));
        assert!(via.is_rfc3261_branch());
    }

    #[test]
    fn test_allow_lists_every_method() {
        let allow = UserAgentCore::allow_value();
        assert!(allow.starts_with("INVITE, ACK, CANCEL, BYE"));
        assert!(allow.ends_with("UPDATE, INFO"));
    }

    #[test]
    fn test_malformed_input_is_dropped() {
        let mut core = core();
        core.receive_bytes(b"this is not sip\r\n\r\n");
        assert!(core.take_outgoing().is_empty());
        assert!(core.poll_event().is_none());
    }
}
