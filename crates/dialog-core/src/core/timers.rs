//! Timer dispatch
//!
//! Every timer in the system lives in the one [`TimerScheduler`] owned by
//! the core's IO context. The runner sleeps until
//! [`next_timer_deadline`](UserAgentCore::next_timer_deadline) and then calls
//! [`fire_timers`](UserAgentCore::fire_timers), which pops expired entries
//! in deadline order. The clock is moved to each deadline before its timer
//! runs so that timers started from inside a handler are scheduled relative
//! to when they should have fired, not when the runner woke up.
//!
//! [`TimerScheduler`]: crate::transaction::timer::TimerScheduler

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sipflow_sip_core::prelude::*;

use super::{DialogEntry, UserAgentCore};
use crate::dialog::{DialogId, SessionTimerOutcome, SubscriptionTimerOutcome};
use crate::events::TerminationReason;
use crate::transaction::timer::{DialogTimer, TimerTarget, TimerType};
use crate::transaction::{Transaction, TransactionKey};
use crate::user_agent::{ResponseOptions, RequestOptions};

impl UserAgentCore {
    /// Runs every timer due at or before `now`. Returns how many fired.
    pub fn fire_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(expired) = self.io.scheduler_mut().pop_expired(now) {
            self.io.set_now(expired.deadline);
            trace!(token = ?expired.token, target = ?expired.target, "Timer fired");
            match expired.target {
                TimerTarget::Transaction(key, timer) => self.transaction_timer(&key, timer),
                TimerTarget::Dialog(id, timer) => self.dialog_timer(&id, timer),
            }
            fired += 1;
        }
        self.io.set_now(now);
        fired
    }

    fn transaction_timer(&mut self, key: &TransactionKey, timer: TimerType) {
        if let Some(server) = self.servers.get_mut(key) {
            match server.transaction_mut().on_timer(timer, &mut self.io) {
                Ok(events) if !events.is_empty() => {
                    debug!(tx = %key, %timer, ?events, "Server transaction gave up");
                }
                Ok(_) => {}
                Err(e) => warn!(tx = %key, %timer, error = %e, "Server timer failed"),
            }
            self.remove_terminated_server(key);
            return;
        }

        let Some(&id) = self.client_index.get(key) else {
            trace!(tx = %key, %timer, "Timer for a finished transaction");
            return;
        };
        let result = match self.clients.get_mut(&id) {
            Some(client) => client.on_timer(key, timer, &mut self.io),
            None => return,
        };
        match result {
            Ok(outcomes) => self.handle_client_outcomes(id, outcomes),
            Err(e) => warn!(tx = %key, %timer, error = %e, "Client timer failed"),
        }
    }

    fn dialog_timer(&mut self, id: &DialogId, timer: DialogTimer) {
        let Some(entry) = self.dialogs.get_mut(id) else {
            trace!(dialog = %id, %timer, "Timer for a finished dialog");
            return;
        };
        match entry {
            DialogEntry::Session(session) => match session.on_timer(timer, &mut self.io) {
                SessionTimerOutcome::AckTimedOut => self.ack_timed_out(id),
                SessionTimerOutcome::PrackTimedOut => self.prack_timed_out(id),
                SessionTimerOutcome::Retransmitted | SessionTimerOutcome::Ignored => {}
            },
            DialogEntry::Subscription(subscription) => match subscription.on_timer(timer, &mut self.io) {
                SubscriptionTimerOutcome::Refresh => self.refresh_subscription(id),
                SubscriptionTimerOutcome::Expired => {
                    self.terminate_dialog(id, TerminationReason::SubscriptionEnded);
                }
                SubscriptionTimerOutcome::Ignored => {}
            },
        }
    }

    /// RFC 3261 §13.3.1.4: no ACK for our 2xx, so the session is torn down
    fn ack_timed_out(&mut self, id: &DialogId) {
        let bye = self
            .dialogs
            .get_mut(id)
            .and_then(DialogEntry::as_session_mut)
            .map(|session| session.create_request(Method::Bye, &RequestOptions::default()));
        match bye {
            Some(Ok(bye)) => {
                if let Err(e) = self.start_client(bye, Some(id.clone()), true) {
                    warn!(dialog = %id, error = %e, "Cannot send BYE after ACK timeout");
                }
            }
            Some(Err(e)) => warn!(dialog = %id, error = %e, "Cannot build BYE after ACK timeout"),
            None => {}
        }
        self.terminate_dialog(id, TerminationReason::AckTimeout);
    }

    /// RFC 3262 §3: a reliable provisional never PRACKed fails the INVITE
    /// with 5xx
    fn prack_timed_out(&mut self, id: &DialogId) {
        let pending = self
            .servers
            .iter()
            .find(|(_, server)| {
                server.request().method == Method::Invite
                    && server.is_pending()
                    && server.dialog_id.as_ref() == Some(id)
            })
            .map(|(key, _)| key.clone());
        if let Some(key) = pending {
            self.respond_automatically(&key, StatusCode::SERVER_TIMEOUT, ResponseOptions::default());
        }
        self.terminate_dialog(id, TerminationReason::Failed);
    }

    fn refresh_subscription(&mut self, id: &DialogId) {
        let subscribe = self
            .dialogs
            .get_mut(id)
            .and_then(DialogEntry::as_subscription_mut)
            .map(|subscription| {
                let expires = subscription.expires();
                subscription.create_subscribe(expires, &RequestOptions::default())
            });
        match subscribe {
            Some(Ok(subscribe)) => {
                debug!(dialog = %id, "Refreshing subscription");
                if let Err(e) = self.start_client(subscribe, Some(id.clone()), true) {
                    warn!(dialog = %id, error = %e, "Subscription refresh not sent");
                }
            }
            Some(Err(e)) => warn!(dialog = %id, error = %e, "Cannot build refreshing SUBSCRIBE"),
            None => {}
        }
    }
}
