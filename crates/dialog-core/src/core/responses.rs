//! Inbound responses and the outcomes of our requests
//!
//! Responses are matched to a client by (top Via branch, CSeq method);
//! anything unmatched is dropped. Dialog creation on the UAC side happens
//! here: early dialogs from 1xx with a To-tag, confirmed ones from 2xx,
//! one per To-tag when an INVITE forks.
//!
//! ```text
//!  INVITE ──► 180 (tag a) ──► early dialog a
//!         ──► 200 (tag a) ──► dialog a confirmed ──► Accept ──► app ACKs a
//!         ──► 200 (tag b) ──► dialog b ──► ACK + BYE (released)
//! ```

use tracing::{debug, info, trace, warn};

use sipflow_sip_core::prelude::*;

use super::requests::{expires_header, DEFAULT_SUBSCRIPTION_EXPIRES};
use super::{DialogEntry, UserAgentCore};
use crate::dialog::{Dialog, DialogId, SessionDialog, SubscriptionDialog};
use crate::events::{OutgoingEvent, RejectCause, TerminationReason, UserAgentEvent};
use crate::transaction::{TransactionIo, TransactionKey};
use crate::user_agent::client::ClientOutcome;
use crate::user_agent::{ClientId, RequestOptions};

impl UserAgentCore {
    pub(super) fn receive_response(&mut self, response: Response) {
        let Some(key) = TransactionKey::from_response(&response) else {
            trace!("Dropping response without branch");
            return;
        };
        let Some(&id) = self.client_index.get(&key) else {
            trace!(tx = %key, status = %response.status, "Dropping unmatched response");
            return;
        };
        let credentials = self.config.credentials();
        let result = match self.clients.get_mut(&id) {
            Some(client) => client.receive_response(response, credentials, &mut self.io),
            None => return,
        };
        match result {
            Ok(outcomes) => self.handle_client_outcomes(id, outcomes),
            Err(e) => debug!(%id, error = %e, "Response refused"),
        }
    }

    pub(super) fn handle_client_outcomes(&mut self, id: ClientId, outcomes: Vec<ClientOutcome>) {
        for outcome in outcomes {
            self.handle_client_outcome(id, outcome);
        }
        self.index_client(id);
        self.remove_terminated_client(id);
    }

    fn handle_client_outcome(&mut self, id: ClientId, outcome: ClientOutcome) {
        let event = match outcome {
            ClientOutcome::Trying(response) => Some(OutgoingEvent::Trying(response)),
            ClientOutcome::Progress(response) => self.client_progress(id, response),
            ClientOutcome::Accept(response) => self.client_accept(id, response),
            ClientOutcome::Redirect(response) => {
                self.client_failed(id, None);
                Some(OutgoingEvent::Redirect(response))
            }
            ClientOutcome::Reject(cause) => {
                self.client_failed(id, Some(&cause));
                Some(OutgoingEvent::Reject(cause))
            }
            ClientOutcome::AuthRetry { previous, current } => {
                self.client_reauthenticated(id, &previous, &current);
                None
            }
        };
        let Some(event) = event else {
            return;
        };
        if self.clients.get(&id).is_some_and(|c| !c.internal) {
            self.emit(UserAgentEvent::Outgoing { id, event });
        }
    }

    // ---- provisional -----------------------------------------------------------

    fn client_progress(&mut self, id: ClientId, response: Response) -> Option<OutgoingEvent> {
        let contact = self.contact();
        let settings = self.config.timers;
        let reliable_transport = self.config.reliable_transport;
        let client = self.clients.get_mut(&id)?;
        if *client.method() != Method::Invite || response.to_tag().is_none() {
            return Some(OutgoingEvent::Progress {
                response,
                dialog: client.dialog_id.clone(),
            });
        }

        let dialog_id = match &client.dialog_id {
            Some(existing) => existing.clone(),
            None => {
                let dialog_id = DialogId::from_incoming_response(&response)?;
                if !self.dialogs.contains_key(&dialog_id) {
                    match Dialog::new_uac(client.request(), &response, contact) {
                        Ok(dialog) => {
                            let mut session = SessionDialog::new(dialog, settings, reliable_transport);
                            if let Err(e) = session.apply_request(client.request(), true) {
                                warn!(dialog = %dialog_id, error = %e, "Offer not recorded");
                            }
                            client.forks.push(dialog_id.clone());
                            self.dialogs
                                .insert(dialog_id.clone(), DialogEntry::Session(session));
                        }
                        Err(e) => {
                            warn!(%id, error = %e, "Cannot create early dialog");
                            return Some(OutgoingEvent::Progress { response, dialog: None });
                        }
                    }
                }
                dialog_id
            }
        };

        // Reliable provisionals: drop duplicates, and only these carry an
        // offer or answer
        if response.headers.has_option_tag(&HeaderName::Require, "100rel") {
            if let Some(session) = self.dialogs.get_mut(&dialog_id).and_then(DialogEntry::as_session_mut) {
                if !session.receive_reliable_provisional(&response) {
                    return None;
                }
                if let Err(e) = session.apply_response(&response, false) {
                    warn!(dialog = %dialog_id, error = %e, "Provisional session description refused");
                }
            }
        }
        Some(OutgoingEvent::Progress {
            response,
            dialog: Some(dialog_id),
        })
    }

    // ---- success ---------------------------------------------------------------

    fn client_accept(&mut self, id: ClientId, response: Response) -> Option<OutgoingEvent> {
        let client = self.clients.get(&id)?;
        let method = client.method().clone();
        let in_dialog = client.dialog_id.clone();
        match (method, in_dialog) {
            (Method::Invite, None) => self.invite_accepted(id, response),
            (Method::Subscribe, None) => self.subscribe_accepted(id, response),
            (method, Some(dialog_id)) => {
                self.dialog_request_accepted(&dialog_id, &method, &response);
                Some(OutgoingEvent::Accept {
                    response,
                    dialog: Some(dialog_id),
                })
            }
            (_, None) => Some(OutgoingEvent::Accept { response, dialog: None }),
        }
    }

    /// 2xx to an initial INVITE. Each To-tag gets its own dialog; branches
    /// beyond the first acknowledged one, or beyond `max_forks`, are
    /// acknowledged and released.
    fn invite_accepted(&mut self, id: ClientId, response: Response) -> Option<OutgoingEvent> {
        let dialog_id = DialogId::from_incoming_response(&response)?;
        let contact = self.contact();
        let settings = self.config.timers;
        let reliable_transport = self.config.reliable_transport;
        let max_forks = self.config.max_forks;
        let client = self.clients.get_mut(&id)?;

        if let Some(ack) = client.released.get(&dialog_id) {
            trace!(dialog = %dialog_id, "2xx retransmission on a released fork");
            self.io.send(ack.clone().into(), None);
            return None;
        }

        let confirmed_before = self
            .dialogs
            .get(&dialog_id)
            .is_some_and(|entry| entry.dialog().is_confirmed());
        if confirmed_before {
            trace!(dialog = %dialog_id, "2xx retransmission awaiting the application's ACK");
            return None;
        }

        let confirmed_forks = client
            .forks
            .iter()
            .filter(|f| self.dialogs.get(*f).is_some_and(|e| e.dialog().is_confirmed()))
            .count();
        match self.dialogs.get_mut(&dialog_id).and_then(DialogEntry::as_session_mut) {
            Some(session) => {
                let dialog = session.dialog_mut();
                dialog.confirm();
                dialog.recompute_route_set(&response);
                dialog.refresh_target(&response);
            }
            None => match Dialog::new_uac(client.request(), &response, contact) {
                Ok(dialog) => {
                    let mut session = SessionDialog::new(dialog, settings, reliable_transport);
                    if let Err(e) = session.apply_request(client.request(), true) {
                        warn!(dialog = %dialog_id, error = %e, "Offer not recorded");
                    }
                    client.forks.push(dialog_id.clone());
                    self.dialogs
                        .insert(dialog_id.clone(), DialogEntry::Session(session));
                }
                Err(e) => {
                    warn!(%id, error = %e, "2xx cannot establish a dialog");
                    return Some(OutgoingEvent::Accept { response, dialog: None });
                }
            },
        }
        if let Some(session) = self.dialogs.get_mut(&dialog_id).and_then(DialogEntry::as_session_mut) {
            if let Err(e) = session.apply_response(&response, false) {
                warn!(dialog = %dialog_id, error = %e, "Answer refused");
            }
        }
        info!(dialog = %dialog_id, "Dialog confirmed by {}", response.status);

        let already_chosen = client.acked_fork.is_some();
        if already_chosen || confirmed_forks >= max_forks {
            debug!(dialog = %dialog_id, already_chosen, confirmed_forks, "Releasing extra fork");
            self.release_fork(id, &dialog_id);
            return None;
        }
        Some(OutgoingEvent::Accept {
            response,
            dialog: Some(dialog_id),
        })
    }

    /// Sends ACK then BYE on a forked dialog the application did not pick
    pub(super) fn release_fork(&mut self, id: ClientId, dialog_id: &DialogId) {
        let Some(session) = self.dialogs.get_mut(dialog_id).and_then(DialogEntry::as_session_mut) else {
            return;
        };
        let ack = match session.create_ack(&RequestOptions::default()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(dialog = %dialog_id, error = %e, "Cannot ACK released fork");
                return;
            }
        };
        let bye = session.create_request(Method::Bye, &RequestOptions::default());
        let ack = self.stamp_ack(ack);
        self.io.send(ack.clone().into(), None);
        if let Some(client) = self.clients.get_mut(&id) {
            if let Some(invite) = client.transaction_mut().as_invite_mut() {
                invite.cache_ack(&dialog_id.remote_tag, ack.clone());
            }
            client.released.insert(dialog_id.clone(), ack);
        }
        match bye {
            Ok(bye) => {
                if let Err(e) = self.start_client(bye, Some(dialog_id.clone()), true) {
                    warn!(dialog = %dialog_id, error = %e, "Cannot send BYE to released fork");
                }
            }
            Err(e) => warn!(dialog = %dialog_id, error = %e, "Cannot build BYE for released fork"),
        }
        self.terminate_dialog(dialog_id, TerminationReason::ForkReleased);
    }

    /// An ACK for a 2xx is sent outside any transaction but still needs
    /// our Via
    pub(super) fn stamp_ack(&self, mut ack: Request) -> Request {
        ack.headers.via.insert(0, self.new_via());
        ack.headers
            .set(HeaderName::UserAgent, self.config.user_agent_string.clone());
        ack
    }

    fn subscribe_accepted(&mut self, id: ClientId, response: Response) -> Option<OutgoingEvent> {
        let dialog_id = DialogId::from_incoming_response(&response)?;
        let contact = self.contact();
        let timers = self.config.timers;
        let client = self.clients.get_mut(&id)?;
        if !self.dialogs.contains_key(&dialog_id) {
            let subscribe = client.request();
            let event = subscribe.headers.get(&HeaderName::Event).unwrap_or_default().to_string();
            let expires = expires_header(&subscribe.headers).unwrap_or(DEFAULT_SUBSCRIPTION_EXPIRES);
            match Dialog::new_uac(subscribe, &response, contact) {
                Ok(dialog) => {
                    client.forks.push(dialog_id.clone());
                    let subscription = SubscriptionDialog::new_subscriber(dialog, event, expires, timers);
                    self.dialogs
                        .insert(dialog_id.clone(), DialogEntry::Subscription(subscription));
                }
                Err(e) => {
                    warn!(%id, error = %e, "2xx cannot establish a subscription");
                    return Some(OutgoingEvent::Accept { response, dialog: None });
                }
            }
        }
        if let Some(subscription) = self
            .dialogs
            .get_mut(&dialog_id)
            .and_then(DialogEntry::as_subscription_mut)
        {
            subscription.receive_subscribe_response(&response, &mut self.io);
        }
        Some(OutgoingEvent::Accept {
            response,
            dialog: Some(dialog_id),
        })
    }

    fn dialog_request_accepted(&mut self, dialog_id: &DialogId, method: &Method, response: &Response) {
        let Some(entry) = self.dialogs.get_mut(dialog_id) else {
            return;
        };
        match entry {
            DialogEntry::Session(session) => {
                if matches!(method, Method::Invite | Method::Update) {
                    session.dialog_mut().refresh_target(response);
                }
                if matches!(method, Method::Invite | Method::Update | Method::Prack) {
                    if let Err(e) = session.apply_response(response, false) {
                        warn!(dialog = %dialog_id, error = %e, "Answer refused");
                    }
                }
            }
            DialogEntry::Subscription(subscription) => {
                if *method == Method::Subscribe {
                    subscription.receive_subscribe_response(response, &mut self.io);
                }
            }
        }
    }

    // ---- failure -----------------------------------------------------------------

    fn client_failed(&mut self, id: ClientId, cause: Option<&RejectCause>) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let method = client.method().clone();
        match client.dialog_id.clone() {
            // Initial INVITE: its early dialogs die with it
            None if method == Method::Invite => {
                let early: Vec<DialogId> = client
                    .forks
                    .iter()
                    .filter(|f| self.dialogs.get(*f).is_some_and(|e| e.dialog().is_early()))
                    .cloned()
                    .collect();
                for dialog_id in early {
                    self.terminate_dialog(&dialog_id, TerminationReason::Failed);
                }
            }
            None => {}
            Some(dialog_id) => {
                if matches!(method, Method::Invite | Method::Update) {
                    if let Some(session) = self.dialogs.get_mut(&dialog_id).and_then(DialogEntry::as_session_mut) {
                        session.signaling_state_rollback();
                    }
                }
                // RFC 3261 §12.2.1.2
                let status = cause.map(RejectCause::status);
                if matches!(status, Some(481) | Some(408)) && method != Method::Bye {
                    let reason = if self.subscription(&dialog_id).is_some() {
                        TerminationReason::SubscriptionEnded
                    } else {
                        TerminationReason::Failed
                    };
                    self.terminate_dialog(&dialog_id, reason);
                }
            }
        }
    }

    /// `previous` stays indexed while the client keeps it for retransmitted
    /// challenges; the client is dropped only once both have terminated
    fn client_reauthenticated(&mut self, id: ClientId, previous: &TransactionKey, current: &TransactionKey) {
        if self.clients.get(&id).and_then(|c| c.challenged_key()) != Some(previous) {
            self.client_index.remove(previous);
        }
        self.client_index.insert(current.clone(), id);
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let cseq = client.request().cseq().seq;
        let method = client.method().clone();
        if let Some(dialog_id) = client.dialog_id.clone() {
            if let Some(entry) = self.dialogs.get_mut(&dialog_id) {
                let dialog = entry.dialog_mut();
                dialog.local_seq = Some(cseq);
                if method == Method::Invite {
                    dialog.invite_seq = cseq;
                }
            }
        }
    }

    // ---- cleanup -----------------------------------------------------------------

    fn remove_terminated_client(&mut self, id: ClientId) {
        if !self.clients.get(&id).is_some_and(|c| c.is_terminated()) {
            return;
        }
        // Timer M (or D) has run out: forks the application never
        // acknowledged are released, early ones are gone
        let pending: Vec<DialogId> = match self.clients.get(&id) {
            Some(client) if *client.method() == Method::Invite && client.dialog_id.is_none() => client
                .forks
                .iter()
                .filter(|f| client.acked_fork.as_ref() != Some(*f))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        for dialog_id in pending {
            let state = self.dialog(&dialog_id).map(|d| (d.is_early(), d.is_confirmed()));
            match state {
                Some((true, _)) => self.terminate_dialog(&dialog_id, TerminationReason::Failed),
                Some((_, true)) => self.release_fork(id, &dialog_id),
                _ => {}
            }
        }

        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        client.dispose(&mut self.io);
        self.client_index.retain(|_, owner| *owner != id);
        self.pending_subscriptions.retain(|_, owner| *owner != id);
        trace!(%id, key = %client.key(), released = client.released.len(), "Client finished");
    }
}
