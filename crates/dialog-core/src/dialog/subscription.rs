//! SUBSCRIBE/NOTIFY dialog usage (RFC 6665)
//!
//! The subscriber refreshes the subscription at 90% of the negotiated
//! expiration and treats it as gone when the expiration timer fires
//! unrefreshed. Timer N bounds the wait for the first NOTIFY after a 2xx
//! to the initial SUBSCRIBE. The notifier side only tracks expiration and
//! the state it last announced.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sipflow_sip_core::prelude::*;

use super::{Dialog, DialogId, DialogTimers};
use crate::errors::{DialogError, DialogResult};
use crate::transaction::timer::{DialogTimer, TimerSettings};
use crate::transaction::TransactionIo;
use crate::user_agent::options::RequestOptions;

/// Subscription state as carried in `Subscription-State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Terminated => "terminated",
        }
    }
}

/// Which end of the subscription we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionRole {
    Subscriber,
    Notifier,
}

/// What a fired subscription timer asks the user agent core to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTimerOutcome {
    /// Send a refreshing SUBSCRIBE
    Refresh,
    /// The subscription has ended and the dialog should be removed
    Expired,
    Ignored,
}

/// Parsed `Subscription-State` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriptionStateHeader {
    pub state: SubscriptionState,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

pub(crate) fn parse_subscription_state(value: &str) -> DialogResult<SubscriptionStateHeader> {
    let mut parts = value.split(';').map(str::trim);
    let state = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("active") => SubscriptionState::Active,
        Some("pending") => SubscriptionState::Pending,
        Some("terminated") => SubscriptionState::Terminated,
        _ => {
            return Err(DialogError::protocol_error(format!(
                "invalid Subscription-State '{}'",
                value
            )))
        }
    };
    let mut header = SubscriptionStateHeader {
        state,
        expires: None,
        reason: None,
    };
    for param in parts {
        match param.split_once('=') {
            Some((name, v)) if name.trim().eq_ignore_ascii_case("expires") => {
                header.expires = v.trim().parse().ok();
            }
            Some((name, v)) if name.trim().eq_ignore_ascii_case("reason") => {
                header.reason = Some(v.trim().to_string());
            }
            _ => {}
        }
    }
    Ok(header)
}

/// A dialog created by SUBSCRIBE (or by the NOTIFY answering it)
#[derive(Debug, Clone)]
pub struct SubscriptionDialog {
    dialog: Dialog,
    role: SubscriptionRole,
    event: String,
    expires: u32,
    state: SubscriptionState,
    notified: bool,
    settings: TimerSettings,
    timers: DialogTimers,
}

impl SubscriptionDialog {
    /// Subscriber side. `expires` is what the SUBSCRIBE asked for.
    pub fn new_subscriber(dialog: Dialog, event: impl Into<String>, expires: u32, settings: TimerSettings) -> Self {
        Self::new(dialog, SubscriptionRole::Subscriber, event.into(), expires, settings)
    }

    /// Notifier side, after accepting a SUBSCRIBE for `expires` seconds
    pub fn new_notifier(
        dialog: Dialog,
        event: impl Into<String>,
        expires: u32,
        settings: TimerSettings,
        io: &mut dyn TransactionIo,
    ) -> Self {
        let mut subscription = Self::new(dialog, SubscriptionRole::Notifier, event.into(), expires, settings);
        subscription.schedule(io);
        subscription
    }

    fn new(dialog: Dialog, role: SubscriptionRole, event: String, expires: u32, settings: TimerSettings) -> Self {
        info!(dialog = %dialog.id, %event, ?role, "Subscription dialog created");
        Self {
            dialog,
            role,
            event,
            expires,
            state: SubscriptionState::Pending,
            notified: false,
            settings,
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

    pub fn role(&self) -> SubscriptionRole {
        self.role
    }

    /// Event package
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Negotiated expiration in seconds
    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SubscriptionState::Terminated
    }

    // Refresh at 90% of the expiration (subscriber only), expire at 100%
    fn schedule(&mut self, io: &mut dyn TransactionIo) {
        self.timers.stop(io, DialogTimer::Refresh);
        self.timers.stop(io, DialogTimer::Expiration);
        if self.expires == 0 || self.is_terminated() {
            return;
        }
        let expiration = Duration::from_secs(u64::from(self.expires));
        if self.role == SubscriptionRole::Subscriber {
            self.timers
                .start(io, &self.dialog.id, DialogTimer::Refresh, expiration * 9 / 10);
        }
        self.timers.start(io, &self.dialog.id, DialogTimer::Expiration, expiration);
    }

    /// Subscriber: a 2xx to our SUBSCRIBE. Its `Expires` may shorten the
    /// requested duration. Timer N starts if no NOTIFY has arrived yet.
    pub fn receive_subscribe_response(&mut self, response: &Response, io: &mut dyn TransactionIo) {
        if !response.status.is_success() {
            return;
        }
        self.dialog.refresh_target(response);
        if let Some(expires) = response
            .headers
            .get(&HeaderName::Expires)
            .and_then(|e| e.trim().parse::<u32>().ok())
        {
            self.expires = self.expires.min(expires);
        }
        debug!(dialog = %self.dialog.id, expires = self.expires, "Subscription accepted");
        if !self.notified {
            self.timers
                .start(io, &self.dialog.id, DialogTimer::TimerN, self.settings.transaction_timeout());
        }
        self.schedule(io);
    }

    /// Subscriber: an in-dialog NOTIFY (or the one that created the
    /// dialog). Returns the new subscription state; on `terminated` every
    /// timer is cancelled and the caller removes the dialog after replying.
    pub fn receive_notify(&mut self, notify: &Request, io: &mut dyn TransactionIo) -> DialogResult<SubscriptionState> {
        let header = notify
            .headers
            .get(&HeaderName::SubscriptionState)
            .ok_or_else(|| DialogError::protocol_error("NOTIFY without Subscription-State"))
            .and_then(parse_subscription_state)?;
        // A dialog created from this very NOTIFY has already recorded its CSeq
        let created_by_it = !self.notified && self.dialog.remote_seq == Some(notify.cseq().seq);
        if !created_by_it {
            self.dialog.receive_request(notify)?;
        }
        self.notified = true;
        self.timers.stop(io, DialogTimer::TimerN);

        let previous = self.state;
        self.state = header.state;
        if header.state == SubscriptionState::Terminated {
            info!(dialog = %self.dialog.id, reason = ?header.reason, "Subscription terminated by notifier");
            self.dispose(io);
            return Ok(SubscriptionState::Terminated);
        }
        if let Some(expires) = header.expires {
            if expires != self.expires {
                self.expires = expires;
                self.schedule(io);
            }
        }
        if previous != self.state {
            debug!(dialog = %self.dialog.id, "Subscription {:?} -> {:?}", previous, self.state);
        }
        Ok(self.state)
    }

    /// Subscriber: in-dialog SUBSCRIBE refreshing (or, with 0, ending) the
    /// subscription
    pub fn create_subscribe(&mut self, expires: u32, options: &RequestOptions) -> DialogResult<Request> {
        let mut options = options.clone();
        options.extra_headers.push((HeaderName::Event, self.event.clone()));
        options.extra_headers.push((HeaderName::Expires, expires.to_string()));
        self.dialog.create_outgoing_request_message(Method::Subscribe, &options)
    }

    /// Subscriber: SUBSCRIBE with `Expires: 0`. Refreshing stops and the
    /// dialog waits at most 64*T1 for the notifier's final NOTIFY.
    pub fn unsubscribe(&mut self, options: &RequestOptions, io: &mut dyn TransactionIo) -> DialogResult<Request> {
        if self.role != SubscriptionRole::Subscriber {
            return Err(DialogError::invalid_state(format!(
                "dialog {} is not a subscriber",
                self.dialog.id
            )));
        }
        let subscribe = self.create_subscribe(0, options)?;
        self.expires = 0;
        self.state = SubscriptionState::Terminated;
        self.timers.stop_all(io);
        self.timers
            .start(io, &self.dialog.id, DialogTimer::TimerN, self.settings.transaction_timeout());
        Ok(subscribe)
    }

    /// Notifier: the peer refreshed the subscription for `expires` seconds
    pub fn refresh(&mut self, expires: u32, io: &mut dyn TransactionIo) {
        self.expires = expires;
        if expires == 0 {
            self.state = SubscriptionState::Terminated;
            self.timers.stop_all(io);
        } else {
            self.schedule(io);
        }
    }

    /// Notifier: NOTIFY announcing `state`
    pub fn create_notify(&mut self, state: SubscriptionState, options: &RequestOptions) -> DialogResult<Request> {
        if self.role != SubscriptionRole::Notifier {
            return Err(DialogError::invalid_state(format!(
                "dialog {} is not a notifier",
                self.dialog.id
            )));
        }
        let value = match state {
            SubscriptionState::Terminated => "terminated;reason=noresource".to_string(),
            _ => format!("{};expires={}", state.as_str(), self.expires),
        };
        let mut options = options.clone();
        options.extra_headers.push((HeaderName::Event, self.event.clone()));
        options.extra_headers.push((HeaderName::SubscriptionState, value));
        let notify = self.dialog.create_outgoing_request_message(Method::Notify, &options)?;
        self.state = state;
        Ok(notify)
    }

    pub fn on_timer(&mut self, timer: DialogTimer, io: &mut dyn TransactionIo) -> SubscriptionTimerOutcome {
        self.timers.fired(timer);
        match timer {
            // Also bounds the wait for the final NOTIFY after unsubscribing
            DialogTimer::TimerN => {
                warn!(dialog = %self.dialog.id, "No NOTIFY received (Timer N)");
                self.dispose(io);
                SubscriptionTimerOutcome::Expired
            }
            _ if self.is_terminated() => SubscriptionTimerOutcome::Ignored,
            DialogTimer::Refresh => SubscriptionTimerOutcome::Refresh,
            DialogTimer::Expiration => {
                info!(dialog = %self.dialog.id, "Subscription expired");
                self.dispose(io);
                SubscriptionTimerOutcome::Expired
            }
            _ => SubscriptionTimerOutcome::Ignored,
        }
    }

    pub fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.timers.stop_all(io);
        self.state = SubscriptionState::Terminated;
        self.dialog.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{request, response_to, TestIo};
    use crate::transaction::timer::TimerTarget;

    fn subscribe() -> Request {
        let mut subscribe = request(Method::Subscribe, "z9hG4bK1");
        subscribe.headers.set(HeaderName::Event, "presence");
        subscribe.headers.set(HeaderName::Expires, "3600");
        subscribe
    }

    fn notify(seq: u32, state: &str) -> Request {
        let mut notify = request(Method::Notify, "z9hG4bK7");
        // The notifier's view: From is bob, To is alice
        notify.headers.from = NameAddr::new("sip:bob@biloxi.example.com".parse().unwrap()).with_tag("bob-tag");
        notify.headers.to = NameAddr::new("sip:alice@atlanta.example.com".parse().unwrap()).with_tag("alice-tag");
        notify.headers.contact = vec![NameAddr::new("sip:bob@192.0.2.4".parse().unwrap())];
        notify.headers.cseq = CSeq::new(seq, Method::Notify);
        notify.headers.set(HeaderName::Event, "presence");
        notify.headers.set(HeaderName::SubscriptionState, state);
        notify
    }

    fn subscriber() -> (SubscriptionDialog, Request) {
        let subscribe = subscribe();
        let ok = response_to(&subscribe, 200, Some("bob-tag"));
        let dialog = Dialog::new_uac(&subscribe, &ok, NameAddr::new("sip:alice@192.0.2.1".parse().unwrap())).unwrap();
        (
            SubscriptionDialog::new_subscriber(dialog, "presence", 3600, TimerSettings::default()),
            subscribe,
        )
    }

    fn duration_of(io: &TestIo, timer: DialogTimer) -> Option<Duration> {
        io.active.values().find_map(|(target, d)| match target {
            TimerTarget::Dialog(_, t) if *t == timer => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn test_parse_subscription_state() {
        let header = parse_subscription_state("active;expires=600").unwrap();
        assert_eq!(header.state, SubscriptionState::Active);
        assert_eq!(header.expires, Some(600));

        let header = parse_subscription_state("Terminated; reason=timeout").unwrap();
        assert_eq!(header.state, SubscriptionState::Terminated);
        assert_eq!(header.reason.as_deref(), Some("timeout"));

        assert!(parse_subscription_state("bogus").is_err());
    }

    #[test]
    fn test_2xx_schedules_refresh_and_timer_n() {
        let (mut subscription, subscribe) = subscriber();
        let mut io = TestIo::new();
        let mut ok = response_to(&subscribe, 200, Some("bob-tag"));
        ok.headers.set(HeaderName::Expires, "600");
        subscription.receive_subscribe_response(&ok, &mut io);

        assert_eq!(subscription.expires(), 600);
        assert_eq!(duration_of(&io, DialogTimer::Refresh), Some(Duration::from_secs(540)));
        assert_eq!(duration_of(&io, DialogTimer::Expiration), Some(Duration::from_secs(600)));
        assert_eq!(duration_of(&io, DialogTimer::TimerN), Some(Duration::from_secs(32)));
    }

    #[test]
    fn test_notify_updates_state_and_cancels_timer_n() {
        let (mut subscription, subscribe) = subscriber();
        let mut io = TestIo::new();
        subscription.receive_subscribe_response(&response_to(&subscribe, 200, Some("bob-tag")), &mut io);

        let state = subscription.receive_notify(&notify(1, "active;expires=1200"), &mut io).unwrap();
        assert_eq!(state, SubscriptionState::Active);
        assert!(!io.has_dialog_timer(DialogTimer::TimerN));
        assert_eq!(subscription.expires(), 1200);
        assert_eq!(duration_of(&io, DialogTimer::Refresh), Some(Duration::from_secs(1080)));

        // Out-of-order NOTIFY
        assert!(subscription.receive_notify(&notify(1, "active"), &mut io).is_err());

        let state = subscription.receive_notify(&notify(2, "terminated;reason=noresource"), &mut io).unwrap();
        assert_eq!(state, SubscriptionState::Terminated);
        assert!(subscription.dialog().is_terminated());
        assert!(io.active.is_empty());
    }

    #[test]
    fn test_timers() {
        let (mut subscription, subscribe) = subscriber();
        let mut io = TestIo::new();
        subscription.receive_subscribe_response(&response_to(&subscribe, 200, Some("bob-tag")), &mut io);

        assert_eq!(subscription.on_timer(DialogTimer::Refresh, &mut io), SubscriptionTimerOutcome::Refresh);
        let refresh = subscription.create_subscribe(3600, &RequestOptions::default()).unwrap();
        assert_eq!(refresh.headers.get(&HeaderName::Event), Some("presence"));
        assert_eq!(refresh.headers.get(&HeaderName::Expires), Some("3600"));
        assert_eq!(refresh.cseq().seq, 2);

        assert_eq!(subscription.on_timer(DialogTimer::TimerN, &mut io), SubscriptionTimerOutcome::Expired);
        assert!(subscription.is_terminated());
        assert_eq!(subscription.on_timer(DialogTimer::Expiration, &mut io), SubscriptionTimerOutcome::Ignored);
    }

    #[test]
    fn test_unsubscribe_waits_for_final_notify() {
        let (mut subscription, subscribe) = subscriber();
        let mut io = TestIo::new();
        subscription.receive_subscribe_response(&response_to(&subscribe, 200, Some("bob-tag")), &mut io);
        subscription.receive_notify(&notify(1, "active"), &mut io).unwrap();

        let unsubscribe = subscription.unsubscribe(&RequestOptions::default(), &mut io).unwrap();
        assert_eq!(unsubscribe.headers.get(&HeaderName::Expires), Some("0"));
        assert!(!io.has_dialog_timer(DialogTimer::Refresh));
        assert!(io.has_dialog_timer(DialogTimer::TimerN));
        assert_eq!(subscription.on_timer(DialogTimer::Refresh, &mut io), SubscriptionTimerOutcome::Ignored);

        let state = subscription.receive_notify(&notify(2, "terminated"), &mut io).unwrap();
        assert_eq!(state, SubscriptionState::Terminated);
        assert!(io.active.is_empty());
    }

    #[test]
    fn test_notifier() {
        let subscribe = subscribe();
        let dialog = Dialog::new_uas(&subscribe, "bob-tag", NameAddr::new("sip:bob@192.0.2.4".parse().unwrap())).unwrap();
        let mut io = TestIo::new();
        let mut notifier = SubscriptionDialog::new_notifier(dialog, "presence", 3600, TimerSettings::default(), &mut io);
        assert!(io.has_dialog_timer(DialogTimer::Expiration));
        assert!(!io.has_dialog_timer(DialogTimer::Refresh));

        let notify = notifier
            .create_notify(SubscriptionState::Active, &RequestOptions::default())
            .unwrap();
        assert_eq!(notify.headers.get(&HeaderName::SubscriptionState), Some("active;expires=3600"));
        assert_eq!(notifier.state(), SubscriptionState::Active);

        notifier.refresh(0, &mut io);
        assert!(notifier.is_terminated());
        assert!(io.active.is_empty());
    }
}
