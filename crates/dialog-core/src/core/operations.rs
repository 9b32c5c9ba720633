//! Application operations
//!
//! Everything the application asks the core to do: originate requests
//! (outside or inside a dialog) and answer the server transactions handed
//! to it in [`UserAgentEvent`](crate::events::UserAgentEvent)s. Outcomes of
//! requests arrive later as `Outgoing` events keyed by the returned
//! [`ClientId`].

use std::collections::HashMap;

use tracing::{debug, info};

use sipflow_sip_core::prelude::*;

use super::requests::{expires_header, DEFAULT_SUBSCRIPTION_EXPIRES};
use super::{DialogEntry, UserAgentCore};
use crate::dialog::{Dialog, DialogId, SessionDialog, SubscriptionDialog, SubscriptionState};
use crate::errors::{DialogError, DialogResult};
use crate::events::TerminationReason;
use crate::transaction::utils::{create_request, RequestTemplate};
use crate::transaction::{TransactionIo, TransactionKey};
use crate::user_agent::{ClientId, RequestOptions, ResponseOptions, UserAgentServer};

impl UserAgentCore {
    // ---- requests outside a dialog -------------------------------------------

    /// Sends an INVITE to `target`. The body of `options`, if any, is the
    /// offer.
    pub fn invite(&mut self, target: Uri, options: RequestOptions) -> DialogResult<ClientId> {
        self.request(Method::Invite, target, options)
    }

    /// Sends an out-of-dialog request. REGISTER uses `target` as the
    /// registrar and the AOR as To.
    pub fn request(&mut self, method: Method, target: Uri, options: RequestOptions) -> DialogResult<ClientId> {
        if matches!(
            method,
            Method::Ack | Method::Cancel | Method::Bye | Method::Prack | Method::Update
        ) {
            return Err(DialogError::protocol_error(format!(
                "{} can only be sent inside a dialog or transaction",
                method
            )));
        }
        let request = self.new_request(method, target, &options);
        info!(method = %request.method, uri = %request.uri, call_id = %request.call_id(), "Sending request");
        self.start_client(request, None, false)
    }

    /// Sends a SUBSCRIBE for `event`. The resulting dialog is created by
    /// the first 2xx or NOTIFY, whichever arrives first.
    pub fn subscribe(
        &mut self,
        target: Uri,
        event: &str,
        expires: u32,
        options: RequestOptions,
    ) -> DialogResult<ClientId> {
        let options = options
            .with_header(HeaderName::Event, event)
            .with_header(HeaderName::Expires, expires.to_string());
        let request = self.new_request(Method::Subscribe, target, &options);
        let pending = (
            request.call_id().to_string(),
            request.from_tag().unwrap_or_default().to_string(),
        );
        let id = self.start_client(request, None, false)?;
        self.pending_subscriptions.insert(pending, id);
        Ok(id)
    }

    fn new_request(&self, method: Method, target: Uri, options: &RequestOptions) -> Request {
        let to = match method {
            Method::Register => NameAddr::new(self.config.aor.clone()),
            _ => NameAddr::new(target.clone()),
        };
        let contact = (method.creates_dialog() || method == Method::Register).then(|| self.contact());
        let mut request = create_request(RequestTemplate {
            method,
            request_uri: target,
            from: NameAddr::new(self.config.aor.clone()),
            to,
            contact,
            route_set: self.config.route_set.clone(),
            cseq: 1,
            user_agent: Some(self.config.user_agent_string.clone()),
        });
        if !self.config.supported_option_tags.is_empty() {
            request.headers.set(HeaderName::Supported, self.supported_value());
        }
        if request.method == Method::Invite {
            request.headers.set(HeaderName::Allow, Self::allow_value());
        }
        options.apply(&mut request);
        request
    }

    /// Cancels a pending INVITE (RFC 3261 §9.1)
    pub fn cancel(&mut self, id: &ClientId) -> DialogResult<()> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| DialogError::not_found("client", id))?;
        client.cancel(&mut self.io)?;
        self.index_client(*id);
        Ok(())
    }

    // ---- requests inside a dialog --------------------------------------------

    /// Acknowledges the 2xx that confirmed `dialog`. For a forked INVITE
    /// this picks the branch: every other confirmed branch is released.
    pub fn ack(&mut self, dialog: &DialogId, options: RequestOptions) -> DialogResult<()> {
        let session = self.session_mut(dialog)?;
        if !session.dialog().is_confirmed() {
            return Err(DialogError::invalid_state(format!("dialog {} is not confirmed", dialog)));
        }
        let ack = session.create_ack(&options)?;
        let invite_seq = session.dialog().invite_seq;
        let ack = self.stamp_ack(ack);
        debug!(dialog = %dialog, cseq = invite_seq, "Sending ACK");
        self.io.send(ack.clone().into(), None);

        let owner = self.clients.iter().find_map(|(id, client)| {
            let owns = *client.method() == Method::Invite
                && client.request().cseq().seq == invite_seq
                && (client.dialog_id.as_ref() == Some(dialog) || client.forks.contains(dialog));
            owns.then_some(*id)
        });
        let Some(owner) = owner else {
            return Ok(());
        };
        let mut others = Vec::new();
        if let Some(client) = self.clients.get_mut(&owner) {
            if let Some(invite) = client.transaction_mut().as_invite_mut() {
                invite.cache_ack(&dialog.remote_tag, ack);
            }
            if client.dialog_id.is_none() && client.acked_fork.is_none() {
                client.acked_fork = Some(dialog.clone());
                others = client.forks.iter().filter(|f| *f != dialog).cloned().collect();
            }
        }
        for other in others {
            if self.dialog(&other).is_some_and(Dialog::is_confirmed) {
                self.release_fork(owner, &other);
            }
        }
        Ok(())
    }

    /// Ends a confirmed dialog with BYE. The dialog is gone as soon as the
    /// BYE is sent.
    pub fn bye(&mut self, dialog: &DialogId) -> DialogResult<ClientId> {
        let entry = self.lookup_dialog_mut(dialog)?;
        if !entry.dialog().is_confirmed() {
            return Err(DialogError::invalid_state(format!(
                "dialog {} is not confirmed, use cancel or reject",
                dialog
            )));
        }
        let bye = entry
            .dialog_mut()
            .create_outgoing_request_message(Method::Bye, &RequestOptions::default())?;
        let id = self.start_client(bye, Some(dialog.clone()), false)?;
        self.terminate_dialog(dialog, TerminationReason::LocalBye);
        Ok(id)
    }

    /// Sends a request inside `dialog`: re-INVITE, UPDATE, INFO, MESSAGE,
    /// REFER and the like. Bodies of INVITE and UPDATE go through the
    /// offer/answer state machine.
    pub fn dialog_request(&mut self, dialog: &DialogId, method: Method, options: RequestOptions) -> DialogResult<ClientId> {
        if matches!(method, Method::Ack | Method::Cancel | Method::Bye | Method::Prack) {
            return Err(DialogError::protocol_error(format!(
                "{} has its own operation",
                method
            )));
        }
        let request = match self.lookup_dialog_mut(dialog)? {
            DialogEntry::Session(session) => session.create_request(method, &options)?,
            DialogEntry::Subscription(subscription) => subscription
                .dialog_mut()
                .create_outgoing_request_message(method, &options)?,
        };
        self.start_client(request, Some(dialog.clone()), false)
    }

    /// PRACK for the last reliable provisional received in `dialog`
    pub fn prack(&mut self, dialog: &DialogId, options: RequestOptions) -> DialogResult<ClientId> {
        let prack = self.session_mut(dialog)?.create_prack(&options)?;
        self.start_client(prack, Some(dialog.clone()), false)
    }

    /// Notifier: sends NOTIFY with `state`. Notifying `terminated` ends the
    /// subscription.
    pub fn notify(&mut self, dialog: &DialogId, state: SubscriptionState, options: RequestOptions) -> DialogResult<ClientId> {
        let notify = self.subscription_mut(dialog)?.create_notify(state, &options)?;
        let id = self.start_client(notify, Some(dialog.clone()), false)?;
        if state == SubscriptionState::Terminated {
            self.terminate_dialog(dialog, TerminationReason::SubscriptionEnded);
        }
        Ok(id)
    }

    /// Subscriber: ends the subscription with `Expires: 0`
    pub fn unsubscribe(&mut self, dialog: &DialogId) -> DialogResult<ClientId> {
        let subscription = self
            .dialogs
            .get_mut(dialog)
            .and_then(DialogEntry::as_subscription_mut)
            .ok_or_else(|| DialogError::not_found("subscription", dialog))?;
        let subscribe = subscription.unsubscribe(&RequestOptions::default(), &mut self.io)?;
        self.start_client(subscribe, Some(dialog.clone()), false)
    }

    fn session_mut(&mut self, dialog: &DialogId) -> DialogResult<&mut SessionDialog> {
        Self::session_entry(&mut self.dialogs, dialog)
    }

    fn subscription_mut(&mut self, dialog: &DialogId) -> DialogResult<&mut SubscriptionDialog> {
        Self::subscription_entry(&mut self.dialogs, dialog)
    }

    // The `*_entry` helpers borrow one map only, so the result can be used
    // alongside `&mut self.io`

    fn session_entry<'a>(
        dialogs: &'a mut HashMap<DialogId, DialogEntry>,
        dialog: &DialogId,
    ) -> DialogResult<&'a mut SessionDialog> {
        dialogs
            .get_mut(dialog)
            .and_then(DialogEntry::as_session_mut)
            .ok_or_else(|| DialogError::not_found("session", dialog))
    }

    fn subscription_entry<'a>(
        dialogs: &'a mut HashMap<DialogId, DialogEntry>,
        dialog: &DialogId,
    ) -> DialogResult<&'a mut SubscriptionDialog> {
        dialogs
            .get_mut(dialog)
            .and_then(DialogEntry::as_subscription_mut)
            .ok_or_else(|| DialogError::not_found("subscription", dialog))
    }

    fn server_entry<'a>(
        servers: &'a mut HashMap<TransactionKey, UserAgentServer>,
        key: &TransactionKey,
    ) -> DialogResult<&'a mut UserAgentServer> {
        servers
            .get_mut(key)
            .ok_or_else(|| DialogError::not_found("server transaction", key))
    }

    // ---- answering -----------------------------------------------------------

    fn lookup_server(&self, key: &TransactionKey) -> DialogResult<&UserAgentServer> {
        self.servers
            .get(key)
            .ok_or_else(|| DialogError::not_found("server transaction", key))
    }

    /// Dialog the request of `key` arrived in or created so far
    pub fn server_dialog(&self, key: &TransactionKey) -> Option<&DialogId> {
        self.servers.get(key)?.dialog_id.as_ref()
    }

    pub fn trying(&mut self, key: &TransactionKey) -> DialogResult<()> {
        Self::server_entry(&mut self.servers, key)?.trying(&mut self.io)
    }

    /// 101-199 to an INVITE. Any status above 100 creates the early dialog;
    /// `options.reliable` sends it reliably (RFC 3262), which the peer must
    /// support.
    pub fn progress(&mut self, key: &TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        let server = self.lookup_server(key)?;
        let mut response = server.build_progress(status, &options)?;
        if options.reliable {
            let request = server.request();
            let supported = request.headers.has_option_tag(&HeaderName::Supported, "100rel")
                || request.headers.has_option_tag(&HeaderName::Require, "100rel");
            if !supported {
                return Err(DialogError::protocol_error("peer does not support 100rel"));
            }
        }
        let dialog = self.uas_session(key)?;
        if options.reliable {
            let session = Self::session_entry(&mut self.dialogs, &dialog)?;
            response = session.send_reliable_provisional(response, &mut self.io)?;
            session.apply_response(&response, true)?;
        }
        Self::server_entry(&mut self.servers, key)?.send(response.clone(), &mut self.io)?;
        Ok(response)
    }

    /// 2xx. For an initial INVITE this confirms the dialog and starts
    /// waiting for the ACK; for SUBSCRIBE it creates (or refreshes) the
    /// notifier side of the subscription.
    pub fn accept(&mut self, key: &TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        let server = self.lookup_server(key)?;
        let mut response = server.build_accept(status, &options)?;
        let method = server.request().method.clone();
        let server_dialog = server.dialog_id.clone();
        match method {
            Method::Invite => {
                let dialog = self.uas_session(key)?;
                let session = self.session_mut(&dialog)?;
                session.apply_response(&response, true)?;
                session.dialog_mut().confirm();
                Self::server_entry(&mut self.servers, key)?.send(response.clone(), &mut self.io)?;
                Self::session_entry(&mut self.dialogs, &dialog)?.start_ack_wait(response.clone(), &mut self.io);
                info!(dialog = %dialog, "Dialog confirmed by {}", response.status);
            }
            Method::Subscribe => {
                let request = server.request().clone();
                let local_tag = server.local_tag().to_string();
                let expires = expires_header(&response.headers)
                    .or_else(|| expires_header(&request.headers))
                    .unwrap_or(DEFAULT_SUBSCRIPTION_EXPIRES);
                if response.headers.get(&HeaderName::Expires).is_none() {
                    response.headers.set(HeaderName::Expires, expires.to_string());
                }
                match server_dialog {
                    Some(dialog) => {
                        Self::subscription_entry(&mut self.dialogs, &dialog)?.refresh(expires, &mut self.io);
                    }
                    None => {
                        let event = request.headers.get(&HeaderName::Event).unwrap_or_default().to_string();
                        let mut dialog = Dialog::new_uas(&request, &local_tag, self.contact())?;
                        dialog.confirm();
                        let id = dialog.id.clone();
                        let subscription =
                            SubscriptionDialog::new_notifier(dialog, event, expires, self.config.timers, &mut self.io);
                        self.dialogs.insert(id.clone(), DialogEntry::Subscription(subscription));
                        Self::server_entry(&mut self.servers, key)?.dialog_id = Some(id);
                    }
                }
                Self::server_entry(&mut self.servers, key)?.send(response.clone(), &mut self.io)?;
            }
            Method::Update => {
                if let Some(dialog) = server_dialog {
                    self.session_mut(&dialog)?.apply_response(&response, true)?;
                }
                Self::server_entry(&mut self.servers, key)?.send(response.clone(), &mut self.io)?;
            }
            _ => {
                Self::server_entry(&mut self.servers, key)?.send(response.clone(), &mut self.io)?;
            }
        }
        self.remove_terminated_server(key);
        Ok(response)
    }

    /// 3xx
    pub fn redirect(&mut self, key: &TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        let response = Self::server_entry(&mut self.servers, key)?.redirect(status, &options, &mut self.io)?;
        self.server_failed(key);
        Ok(response)
    }

    /// 4xx-6xx
    pub fn reject(&mut self, key: &TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        let response = Self::server_entry(&mut self.servers, key)?.reject(status, &options, &mut self.io)?;
        self.server_failed(key);
        Ok(response)
    }

    fn server_failed(&mut self, key: &TransactionKey) {
        let Some(server) = self.servers.get(key) else {
            return;
        };
        let method = server.request().method.clone();
        if let Some(dialog) = server.dialog_id.clone() {
            self.unwind_server_dialog(&method, &dialog);
        }
        self.remove_terminated_server(key);
    }

    /// The early dialog of a failed INVITE goes away; a failed re-INVITE
    /// or UPDATE restores the previous offer/answer and leaves the dialog
    /// up.
    pub(super) fn unwind_server_dialog(&mut self, method: &Method, dialog: &DialogId) {
        let early = self.dialog(dialog).is_some_and(Dialog::is_early);
        if early && *method == Method::Invite {
            self.terminate_dialog(dialog, TerminationReason::Failed);
        } else if matches!(method, Method::Invite | Method::Update) {
            if let Some(session) = self.dialogs.get_mut(dialog).and_then(DialogEntry::as_session_mut) {
                session.signaling_state_rollback();
            }
        }
    }

    /// Session dialog answering the INVITE of `key`, created early on
    /// first use
    fn uas_session(&mut self, key: &TransactionKey) -> DialogResult<DialogId> {
        let server = self.lookup_server(key)?;
        if let Some(dialog) = &server.dialog_id {
            if self.dialogs.contains_key(dialog) {
                return Ok(dialog.clone());
            }
        }
        let request = server.request();
        let dialog = Dialog::new_uas(request, server.local_tag(), self.contact())?;
        let id = dialog.id.clone();
        let mut session = SessionDialog::new(dialog, self.config.timers, self.config.reliable_transport);
        session.apply_request(request, false)?;
        info!(dialog = %id, "Early dialog created");
        self.dialogs.insert(id.clone(), DialogEntry::Session(session));
        Self::server_entry(&mut self.servers, key)?.dialog_id = Some(id.clone());
        Ok(id)
    }
}
