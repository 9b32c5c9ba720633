//! Message builders and a recording I/O used by the unit tests

use std::collections::HashMap;
use std::time::Duration;

use sipflow_sip_core::prelude::*;

use crate::transaction::timer::{DialogTimer, TimerTarget, TimerToken, TimerType};
use crate::transaction::{Outgoing, TransactionIo, TransactionKey};

/// Records sends and timers instead of performing them
#[derive(Debug, Default)]
pub struct TestIo {
    pub sent: Vec<Outgoing>,
    pub active: HashMap<TimerToken, (TimerTarget, Duration)>,
    pub history: Vec<(TimerTarget, Duration)>,
    scheduler: crate::transaction::timer::TimerScheduler,
}

impl TestIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_timer(&self, timer: TimerType) -> bool {
        self.active
            .values()
            .any(|(target, _)| matches!(target, TimerTarget::Transaction(_, t) if *t == timer))
    }

    pub fn has_dialog_timer(&self, timer: DialogTimer) -> bool {
        self.active
            .values()
            .any(|(target, _)| matches!(target, TimerTarget::Dialog(_, t) if *t == timer))
    }

    /// Takes the running `timer` out of `active`, the way the scheduler
    /// pops an expired entry. The test then delivers it with `on_timer`.
    pub fn expire(&mut self, timer: TimerType) -> bool {
        self.expire_where(|target| matches!(target, TimerTarget::Transaction(_, t) if *t == timer))
    }

    pub fn expire_dialog_timer(&mut self, timer: DialogTimer) -> bool {
        self.expire_where(|target| matches!(target, TimerTarget::Dialog(_, t) if *t == timer))
    }

    fn expire_where(&mut self, wanted: impl Fn(&TimerTarget) -> bool) -> bool {
        let token = self
            .active
            .iter()
            .find_map(|(token, (target, _))| wanted(target).then_some(*token));
        token.is_some_and(|token| self.active.remove(&token).is_some())
    }

    /// Duration of the most recent start of `timer`
    pub fn last_duration(&self, timer: TimerType) -> Option<Duration> {
        self.history.iter().rev().find_map(|(target, after)| match target {
            TimerTarget::Transaction(_, t) if *t == timer => Some(*after),
            _ => None,
        })
    }

    pub fn last_request(&self) -> Option<&Request> {
        self.sent.iter().rev().find_map(|o| match &o.message {
            Message::Request(r) => Some(r),
            _ => None,
        })
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.sent.iter().rev().find_map(|o| match &o.message {
            Message::Response(r) => Some(r),
            _ => None,
        })
    }

    pub fn responses(&self) -> Vec<u16> {
        self.sent
            .iter()
            .filter_map(|o| match &o.message {
                Message::Response(r) => Some(r.status.as_u16()),
                _ => None,
            })
            .collect()
    }
}

impl TransactionIo for TestIo {
    fn send(&mut self, message: Message, origin: Option<&TransactionKey>) {
        self.sent.push(Outgoing {
            message,
            origin: origin.cloned(),
        });
    }

    fn start_timer(&mut self, target: TimerTarget, after: Duration) -> TimerToken {
        // Borrow real tokens from a scheduler so they stay unique
        let token = self.scheduler.schedule(tokio::time::Instant::now(), target.clone());
        self.active.insert(token, (target.clone(), after));
        self.history.push((target, after));
        token
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        self.active.remove(&token);
    }
}

pub fn request(method: Method, branch: &str) -> Request {
    let from = NameAddr::new("sip:alice@atlanta.example.com".parse().unwrap()).with_tag("alice-tag");
    let to = NameAddr::new("sip:bob@biloxi.example.com".parse().unwrap());
    let mut headers = MessageHeaders::new(from, to, "call-1@atlanta", CSeq::new(1, method.clone()));
    headers.via.push(Via::new("UDP", "pc33.atlanta.example.com", Some(5060), branch));
    headers.contact.push(NameAddr::new("sip:alice@pc33.atlanta.example.com".parse().unwrap()));
    headers.set(HeaderName::MaxForwards, "70");
    Request::new(method, "sip:bob@biloxi.example.com".parse().unwrap(), headers)
}

pub fn invite(branch: &str) -> Request {
    request(Method::Invite, branch).with_body("application/sdp", "v=0\r\no=alice 1 1 IN IP4 192.0.2.1\r\n")
}

/// Response to `request`, adding `to_tag` when given
pub fn response_to(request: &Request, code: u16, to_tag: Option<&str>) -> Response {
    let mut response = Response::for_request(StatusCode::new(code).unwrap(), request);
    if let Some(tag) = to_tag {
        response.headers.to.set_tag(tag);
    }
    if code > 100 && code < 300 {
        response
            .headers
            .contact
            .push(NameAddr::new("sip:bob@192.0.2.4".parse().unwrap()));
    }
    response
}
