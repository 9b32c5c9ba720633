//! Requests outside INVITE: screening, retransmissions, digest retries

mod common;

use std::time::Duration;

use common::*;
use sipflow_dialog_core::prelude::*;
use sipflow_dialog_core::transaction::utils::create_response;

fn outcome(events: &[UserAgentEvent], id: ClientId) -> Option<&OutgoingEvent> {
    events.iter().find_map(|e| match e {
        UserAgentEvent::Outgoing { id: event_id, event } if *event_id == id => Some(event),
        _ => None,
    })
}

#[test]
fn test_request_for_unknown_user_is_refused_statelessly() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice
        .request(
            Method::Options,
            "sip:carol@biloxi.example.com".parse().unwrap(),
            RequestOptions::default(),
        )
        .unwrap();
    deliver(&mut alice, &mut bob);
    assert!(bob.take_events().is_empty());
    assert_eq!(bob.server_count(), 0);

    let sent = deliver(&mut bob, &mut alice);
    assert_eq!(statuses(&sent), vec![404]);
    match outcome(&alice.take_events(), id) {
        Some(OutgoingEvent::Reject(cause)) => assert_eq!(cause.status(), 404),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_options_is_answered_with_capabilities() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice
        .request(Method::Options, bob_uri(), RequestOptions::default())
        .unwrap();
    deliver(&mut alice, &mut bob);
    assert!(bob.take_events().is_empty());
    let ok = response_with(&deliver(&mut bob, &mut alice), 200).unwrap();
    let allow = ok.headers.get(&HeaderName::Allow).unwrap();
    assert!(allow.contains("INVITE"));
    assert!(allow.contains("PRACK"));
    assert!(ok.headers.has_option_tag(&HeaderName::Supported, "100rel"));
    assert!(matches!(outcome(&alice.take_events(), id), Some(OutgoingEvent::Accept { dialog: None, .. })));
}

#[test]
fn test_message_retransmission_replays_the_final_response() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice
        .request(
            Method::Message,
            bob_uri(),
            RequestOptions::new().with_body(Body::new("text/plain", "Watson, come here.")),
        )
        .unwrap();
    let sent = outgoing(&mut alice);
    bob.receive_message(sent[0].clone());
    let events = bob.take_events();
    let server = match &events[..] {
        [UserAgentEvent::Message { server, request }] => {
            assert_eq!(&request.body[..], b"Watson, come here.");
            server.clone()
        }
        other => panic!("unexpected events {:?}", other),
    };
    bob.accept(&server, 200, ResponseOptions::default()).unwrap();
    let first = outgoing(&mut bob);
    assert_eq!(statuses(&first), vec![200]);
    // No Contact outside dialog-creating methods
    assert!(first[0].headers().contact.is_empty());

    bob.receive_message(sent[0].clone());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![200]);
    assert!(bob.take_events().is_empty());

    for message in first {
        alice.receive_message(message);
    }
    assert!(matches!(outcome(&alice.take_events(), id), Some(OutgoingEvent::Accept { .. })));

    // Timer J, then the server is gone and a late copy is a new request
    advance(&mut bob, Duration::from_secs(33));
    assert_eq!(bob.server_count(), 0);
}

#[test]
fn test_screening_failures() {
    let mut bob = bob();

    // BYE outside any dialog
    let mut bye = Request::new(
        Method::Bye,
        bob_uri(),
        MessageHeaders::new(
            NameAddr::new("sip:alice@atlanta.example.com".parse().unwrap()).with_tag("a1"),
            NameAddr::new(bob_uri()),
            "stray-call",
            CSeq::new(7, Method::Bye),
        ),
    );
    bye.headers
        .via
        .push(Via::new("UDP", "192.0.2.1", Some(5060), generate_branch()));
    bob.receive_message(bye.clone().into());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![481]);

    // Unsupported extension
    let mut invite = bye.clone();
    invite.method = Method::Invite;
    invite.headers.cseq = CSeq::new(8, Method::Invite);
    invite.headers.via[0].set_branch(generate_branch());
    invite.headers.contact = vec![NameAddr::new("sip:alice@192.0.2.1".parse().unwrap())];
    invite.headers.set(HeaderName::Require, "timer-x");
    bob.receive_message(invite.clone().into());
    let refused = outgoing(&mut bob);
    let response = response_with(&refused, 420).unwrap();
    assert_eq!(response.headers.get(&HeaderName::Unsupported), Some("timer-x"));

    // sips: Request-URI
    let mut secure = invite.clone();
    secure.headers.other.remove(&HeaderName::Require);
    secure.headers.via[0].set_branch(generate_branch());
    secure.uri = "sips:bob@biloxi.example.com".parse().unwrap();
    bob.receive_message(secure.into());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![416]);

    assert!(bob.take_events().is_empty());
    assert_eq!(bob.server_count(), 0);
}

#[test]
fn test_preloaded_route_and_gruu() {
    let config = UserAgentCoreConfig::builder(
        "sip:alice@atlanta.example.com".parse().unwrap(),
        "sip:alice@192.0.2.1:5060".parse().unwrap(),
    )
    .with_route_set(vec!["<sip:proxy.atlanta.example.com;lr>".parse().unwrap()])
    .with_user_agent_string("softphone/2.1")
    .build()
    .unwrap();
    let mut alice = UserAgentCore::new(config).unwrap();
    let bob_config = UserAgentCoreConfig::builder(
        "sip:bob@biloxi.example.com".parse().unwrap(),
        "sip:bob@192.0.2.4:5060".parse().unwrap(),
    )
    .with_gruus(None, Some("sip:tgruu.7hs@biloxi.example.com".parse().unwrap()))
    .build()
    .unwrap();
    let mut bob = UserAgentCore::new(bob_config).unwrap();

    let gruu: Uri = "sip:tgruu.7hs@biloxi.example.com".parse().unwrap();
    alice
        .request(Method::Message, gruu.clone(), RequestOptions::default())
        .unwrap();
    let sent = deliver(&mut alice, &mut bob);
    let message = requests(&sent, Method::Message).remove(0);
    assert_eq!(message.uri, gruu);
    assert_eq!(message.headers.route.len(), 1);
    assert_eq!(message.headers.route[0].uri.host, "proxy.atlanta.example.com");
    assert_eq!(message.headers.get(&HeaderName::UserAgent), Some("softphone/2.1"));

    assert!(matches!(&bob.take_events()[..], [UserAgentEvent::Message { .. }]));
}

#[test]
fn test_merged_request_is_refused() {
    let mut alice = alice();
    let mut bob = bob();
    alice.request(Method::Message, bob_uri(), RequestOptions::default()).unwrap();
    let original = requests(&outgoing(&mut alice), Method::Message).remove(0);

    bob.receive_message(original.clone().into());
    assert_eq!(bob.take_events().len(), 1);

    // Same request arriving over a second path
    let mut copy = original;
    copy.headers.via[0].set_branch(generate_branch());
    bob.receive_message(copy.into());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![482]);
    assert!(bob.take_events().is_empty());
}

#[test]
fn test_digest_challenge_is_answered_once() {
    let config = UserAgentCoreConfig::builder(
        "sip:alice@atlanta.example.com".parse().unwrap(),
        "sip:alice@192.0.2.1:5060".parse().unwrap(),
    )
    .with_credentials(Credentials::new("alice", "secret"))
    .build()
    .unwrap();
    let mut alice = UserAgentCore::new(config).unwrap();
    let id = alice
        .request(
            Method::Register,
            "sip:registrar.atlanta.example.com".parse().unwrap(),
            RequestOptions::new().with_header(HeaderName::Expires, "3600"),
        )
        .unwrap();
    let first = requests(&outgoing(&mut alice), Method::Register).remove(0);
    assert_eq!(first.headers.to.uri.to_string(), "sip:alice@atlanta.example.com");
    assert!(!first.headers.contact.is_empty());

    let mut challenge = create_response(&first, StatusCode::UNAUTHORIZED, Some("reg"));
    challenge.headers.set(
        HeaderName::WwwAuthenticate,
        r#"Digest realm="atlanta.example.com", nonce="ea9c8e88df84f1cec4341ae6cbe5a359", algorithm=MD5"#,
    );
    alice.receive_message(challenge.into());
    assert!(alice.take_events().is_empty());

    let retry = requests(&outgoing(&mut alice), Method::Register).remove(0);
    assert_eq!(retry.cseq().seq, first.cseq().seq + 1);
    assert_eq!(retry.call_id(), first.call_id());
    assert_eq!(retry.headers.from.tag(), first.headers.from.tag());
    assert_ne!(retry.branch(), first.branch());
    let authorization = retry.headers.get(&HeaderName::Authorization).unwrap();
    assert!(authorization.starts_with("Digest "));
    assert!(authorization.contains(r#"username="alice""#));
    assert!(authorization.contains(r#"realm="atlanta.example.com""#));
    assert!(authorization.contains(r#"uri="sip:registrar.atlanta.example.com""#));

    // A second challenge is the final answer
    let mut again = create_response(&retry, StatusCode::UNAUTHORIZED, Some("reg"));
    again.headers.set(
        HeaderName::WwwAuthenticate,
        r#"Digest realm="atlanta.example.com", nonce="0123", algorithm=MD5"#,
    );
    alice.receive_message(again.into());
    match outcome(&alice.take_events(), id) {
        Some(OutgoingEvent::Reject(cause)) => assert_eq!(cause.status(), 401),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_authenticated_retry_succeeds() {
    let config = UserAgentCoreConfig::builder(
        "sip:alice@atlanta.example.com".parse().unwrap(),
        "sip:alice@192.0.2.1:5060".parse().unwrap(),
    )
    .with_credentials(Credentials::new("alice", "secret"))
    .build()
    .unwrap();
    let mut alice = UserAgentCore::new(config).unwrap();
    let id = alice
        .request(
            Method::Register,
            "sip:registrar.atlanta.example.com".parse().unwrap(),
            RequestOptions::default(),
        )
        .unwrap();
    let first = requests(&outgoing(&mut alice), Method::Register).remove(0);
    let mut challenge = create_response(&first, StatusCode::UNAUTHORIZED, Some("reg"));
    challenge.headers.set(
        HeaderName::WwwAuthenticate,
        r#"Digest realm="atlanta.example.com", nonce="abc", qop="auth""#,
    );
    alice.receive_message(challenge.into());
    let retry = requests(&outgoing(&mut alice), Method::Register).remove(0);
    let authorization = retry.headers.get(&HeaderName::Authorization).unwrap();
    assert!(authorization.contains("qop=auth"));
    assert!(authorization.contains("nc=00000001"));

    alice.receive_message(create_response(&retry, StatusCode::OK, Some("reg")).into());
    assert!(matches!(outcome(&alice.take_events(), id), Some(OutgoingEvent::Accept { dialog: None, .. })));
    assert_eq!(alice.client(&id).unwrap().key().branch(), retry.branch().unwrap());
}

#[test]
fn test_retransmitted_invite_challenge_is_acknowledged_again() {
    let config = UserAgentCoreConfig::builder(
        "sip:alice@atlanta.example.com".parse().unwrap(),
        "sip:alice@192.0.2.1:5060".parse().unwrap(),
    )
    .with_credentials(Credentials::new("alice", "secret"))
    .build()
    .unwrap();
    let mut alice = UserAgentCore::new(config).unwrap();
    let id = alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    let first = requests(&outgoing(&mut alice), Method::Invite).remove(0);

    let mut challenge = create_response(&first, StatusCode::PROXY_AUTHENTICATION_REQUIRED, Some("proxy"));
    challenge.headers.set(
        HeaderName::ProxyAuthenticate,
        r#"Digest realm="atlanta.example.com", nonce="f84f1cec41e6cbe5aea9c8e88d359", algorithm=MD5"#,
    );
    alice.receive_message(challenge.clone().into());
    let sent = outgoing(&mut alice);
    assert_eq!(requests(&sent, Method::Ack).len(), 1);
    let retry = requests(&sent, Method::Invite).remove(0);
    assert!(retry.headers.get(&HeaderName::ProxyAuthorization).is_some());

    // The proxy did not see our ACK and sends the 407 again
    alice.receive_message(challenge.into());
    let sent = outgoing(&mut alice);
    let acks = requests(&sent, Method::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].branch(), first.branch());
    assert!(requests(&sent, Method::Invite).is_empty());
    assert!(alice.take_events().is_empty());
    assert_eq!(alice.client(&id).unwrap().key().branch(), retry.branch().unwrap());
}

#[test]
fn test_unanswered_request_times_out() {
    let mut alice = alice();
    let id = alice
        .request(Method::Message, bob_uri(), RequestOptions::default())
        .unwrap();
    outgoing(&mut alice);

    advance(&mut alice, Duration::from_secs(31));
    assert!(requests(&outgoing(&mut alice), Method::Message).len() > 3);
    assert!(alice.take_events().is_empty());

    advance(&mut alice, Duration::from_secs(2));
    match outcome(&alice.take_events(), id) {
        Some(OutgoingEvent::Reject(RejectCause::Timeout)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(alice.client(&id).is_none());
}
