//! Two synchronous user agent cores wired back to back.
//!
//! Messages are carried as bytes, so every hop goes through the serializer
//! and the parser exactly as it would on a socket.

#![allow(dead_code)]

use std::time::Duration;

use sipflow_dialog_core::prelude::*;

pub const OFFER: &str = "v=0\r\no=alice 1 1 IN IP4 192.0.2.1\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0\r\n";
pub const ANSWER: &str = "v=0\r\no=bob 2 2 IN IP4 192.0.2.4\r\ns=-\r\nc=IN IP4 192.0.2.4\r\nt=0 0\r\nm=audio 3456 RTP/AVP 0\r\n";

pub fn config(aor: &str, contact: &str) -> UserAgentCoreConfig {
    UserAgentCoreConfig::builder(aor.parse().unwrap(), contact.parse().unwrap())
        .build()
        .unwrap()
}

pub fn alice() -> UserAgentCore {
    UserAgentCore::new(alice_config()).unwrap()
}

pub fn alice_config() -> UserAgentCoreConfig {
    config("sip:alice@atlanta.example.com", "sip:alice@192.0.2.1:5060")
}

pub fn bob() -> UserAgentCore {
    UserAgentCore::new(bob_config()).unwrap()
}

pub fn bob_config() -> UserAgentCoreConfig {
    config("sip:bob@biloxi.example.com", "sip:bob@192.0.2.4:5060")
}

pub fn bob_uri() -> Uri {
    "sip:bob@biloxi.example.com".parse().unwrap()
}

pub fn sdp(content: &str) -> Body {
    Body::sdp(content.to_string())
}

/// Drains `core`'s outbox, round-tripping every message through the wire format
pub fn outgoing(core: &mut UserAgentCore) -> Vec<Message> {
    core.take_outgoing()
        .into_iter()
        .map(|out| parse_message(&out.message.to_bytes()).unwrap())
        .collect()
}

/// Moves everything `from` has queued into `to`; returns what was moved
pub fn deliver(from: &mut UserAgentCore, to: &mut UserAgentCore) -> Vec<Message> {
    let messages = outgoing(from);
    for message in &messages {
        to.receive_message(message.clone());
    }
    messages
}

/// Delivers both ways until neither side has anything left to send
pub fn settle(a: &mut UserAgentCore, b: &mut UserAgentCore) {
    loop {
        let sent = deliver(a, b).len() + deliver(b, a).len();
        if sent == 0 {
            return;
        }
    }
}

pub fn advance(core: &mut UserAgentCore, by: Duration) -> usize {
    let now = core.now() + by;
    core.fire_timers(now)
}

pub fn requests(messages: &[Message], method: Method) -> Vec<Request> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Request(r) if r.method == method => Some(r.clone()),
            _ => None,
        })
        .collect()
}

pub fn statuses(messages: &[Message]) -> Vec<u16> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Response(r) => Some(r.status.as_u16()),
            _ => None,
        })
        .collect()
}

pub fn response_with(messages: &[Message], status: u16) -> Option<Response> {
    messages.iter().find_map(|m| match m {
        Message::Response(r) if r.status.as_u16() == status => Some(r.clone()),
        _ => None,
    })
}

/// The server key of the first event asking for an answer
pub fn server_key(events: &[UserAgentEvent]) -> TransactionKey {
    events
        .iter()
        .find_map(|e| e.server_key().cloned())
        .expect("no event carries a server transaction")
}

pub fn accepted_dialog(events: &[UserAgentEvent]) -> Option<DialogId> {
    events.iter().find_map(|e| match e {
        UserAgentEvent::Outgoing {
            event: OutgoingEvent::Accept { dialog, .. },
            ..
        } => dialog.clone(),
        _ => None,
    })
}

pub fn terminations(events: &[UserAgentEvent]) -> Vec<(DialogId, TerminationReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            UserAgentEvent::DialogTerminated { dialog, reason } => Some((dialog.clone(), *reason)),
            _ => None,
        })
        .collect()
}

/// INVITE with an offer, answered 180 then 200 with the answer.
/// Returns (client, alice's dialog, bob's dialog) with the ACK not yet sent.
pub fn establish(alice: &mut UserAgentCore, bob: &mut UserAgentCore) -> (ClientId, DialogId, DialogId) {
    let id = alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    deliver(alice, bob);
    let events = bob.take_events();
    let server = server_key(&events);

    bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    let ok = bob
        .accept(&server, 200, ResponseOptions::new().with_body(sdp(ANSWER)))
        .unwrap();
    let bob_dialog = DialogId::from_outgoing_response(&ok).unwrap();
    deliver(bob, alice);

    let alice_dialog = accepted_dialog(&alice.take_events()).expect("no Accept event");
    (id, alice_dialog, bob_dialog)
}
