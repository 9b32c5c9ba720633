//! INVITE sessions between two cores: establishment, teardown, CANCEL,
//! glare, reliable provisionals and the timers guarding each of them.

mod common;

use std::time::Duration;

use common::*;
use sipflow_dialog_core::prelude::*;
use sipflow_dialog_core::transaction::utils::create_cancel;

fn reject_status(events: &[UserAgentEvent], id: ClientId) -> Option<u16> {
    events.iter().find_map(|e| match e {
        UserAgentEvent::Outgoing {
            id: event_id,
            event: OutgoingEvent::Reject(cause),
        } if *event_id == id => Some(cause.status()),
        _ => None,
    })
}

#[test]
fn test_basic_call_offer_answer_and_teardown() {
    let mut alice = alice();
    let mut bob = bob();
    let (id, alice_dialog, bob_dialog) = establish(&mut alice, &mut bob);

    assert_eq!(alice_dialog.call_id, bob_dialog.call_id);
    assert_eq!(alice_dialog.local_tag, bob_dialog.remote_tag);
    assert_eq!(alice_dialog.remote_tag, bob_dialog.local_tag);

    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    let sent = deliver(&mut alice, &mut bob);
    assert_eq!(requests(&sent, Method::Ack).len(), 1);
    assert!(bob
        .take_events()
        .iter()
        .any(|e| matches!(e, UserAgentEvent::AckReceived { dialog, .. } if *dialog == bob_dialog)));

    for (core, dialog) in [(&alice, &alice_dialog), (&bob, &bob_dialog)] {
        let session = core.session(dialog).unwrap();
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert_eq!(&session.offer().unwrap().content[..], OFFER.as_bytes());
        assert_eq!(&session.answer().unwrap().content[..], ANSWER.as_bytes());
        assert!(session.dialog().is_confirmed());
    }

    // Timer M keeps the INVITE client around for forked 2xx
    assert!(alice.client(&id).is_some());
    advance(&mut alice, Duration::from_secs(33));
    assert!(alice.client(&id).is_none());

    alice.bye(&alice_dialog).unwrap();
    assert!(alice.dialog(&alice_dialog).is_none());
    assert_eq!(
        terminations(&alice.take_events()),
        vec![(alice_dialog.clone(), TerminationReason::LocalBye)]
    );
    let sent = deliver(&mut alice, &mut bob);
    assert_eq!(requests(&sent, Method::Bye).len(), 1);
    assert_eq!(
        terminations(&bob.take_events()),
        vec![(bob_dialog.clone(), TerminationReason::RemoteBye)]
    );
    assert_eq!(statuses(&deliver(&mut bob, &mut alice)), vec![200]);
    assert_eq!(bob.dialog_count(), 0);
}

#[test]
fn test_out_of_order_request_is_refused_without_teardown() {
    let mut alice = alice();
    let mut bob = bob();
    let (_, alice_dialog, bob_dialog) = establish(&mut alice, &mut bob);
    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    settle(&mut alice, &mut bob);
    bob.take_events();

    // A BYE reusing the INVITE's CSeq
    let mut stale = alice.dialog(&alice_dialog).unwrap().clone();
    stale.local_seq = Some(0);
    let mut bye = stale
        .create_outgoing_request_message(Method::Bye, &RequestOptions::default())
        .unwrap();
    assert_eq!(bye.cseq().seq, 1);
    bye.headers
        .via
        .push(Via::new("UDP", "192.0.2.1", Some(5060), generate_branch()));

    bob.receive_message(bye.into());
    let sent = outgoing(&mut bob);
    assert_eq!(statuses(&sent), vec![500]);
    assert!(bob.take_events().is_empty());
    let dialog = bob.dialog(&bob_dialog).unwrap();
    assert!(dialog.is_confirmed());
    assert_eq!(dialog.remote_seq, Some(1));
}

#[test]
fn test_cancel_after_final_response_only_answers_the_cancel() {
    let mut alice = alice();
    let mut bob = bob();
    alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    let sent = deliver(&mut alice, &mut bob);
    let invite = requests(&sent, Method::Invite).remove(0);
    let server = server_key(&bob.take_events());
    bob.accept(&server, 200, ResponseOptions::new().with_body(sdp(ANSWER)))
        .unwrap();
    assert_eq!(statuses(&outgoing(&mut bob)), vec![200]);

    bob.receive_message(create_cancel(&invite).into());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![200]);
    let events = bob.take_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, UserAgentEvent::Cancelled { .. })));
    assert_eq!(bob.dialog_count(), 1);
}

#[test]
fn test_cancel_during_ringing() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());
    bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    deliver(&mut bob, &mut alice);
    let early = alice
        .take_events()
        .iter()
        .find_map(|e| e.dialog().cloned())
        .expect("180 with a To-tag creates an early dialog");
    assert!(alice.dialog(&early).unwrap().is_early());

    alice.cancel(&id).unwrap();
    let sent = deliver(&mut alice, &mut bob);
    assert_eq!(requests(&sent, Method::Cancel).len(), 1);

    let replies = outgoing(&mut bob);
    let mut codes = statuses(&replies);
    codes.sort_unstable();
    assert_eq!(codes, vec![200, 487]);
    let events = bob.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, UserAgentEvent::Cancelled { server: key, .. } if *key == server)));
    assert_eq!(terminations(&events).len(), 1);
    assert_eq!(terminations(&events)[0].1, TerminationReason::Failed);

    for reply in replies {
        alice.receive_message(reply);
    }
    let events = alice.take_events();
    assert_eq!(reject_status(&events, id), Some(487));
    assert_eq!(terminations(&events), vec![(early, TerminationReason::Failed)]);
    // ACK for the 487
    assert_eq!(requests(&outgoing(&mut alice), Method::Ack).len(), 1);
}

#[test]
fn test_failed_provisional_send_ends_the_early_dialog() {
    let mut alice = alice();
    let mut bob = bob();
    alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());
    let ringing = bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    let bob_dialog = DialogId::from_outgoing_response(&ringing).unwrap();
    assert!(bob.dialog(&bob_dialog).unwrap().is_early());

    let sent = bob.take_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].origin.as_ref(), Some(&server));
    bob.transport_error(sent[0].origin.as_ref());

    let events = bob.take_events();
    assert!(matches!(
        &events[0],
        UserAgentEvent::ServerFailed { server: key, request } if *key == server && request.method == Method::Invite
    ));
    assert_eq!(terminations(&events), vec![(bob_dialog.clone(), TerminationReason::Failed)]);
    assert_eq!(bob.server_count(), 0);
    assert!(bob.dialog(&bob_dialog).is_none());
    assert!(matches!(
        bob.accept(&server, 200, ResponseOptions::default()),
        Err(DialogError::NotFound { .. })
    ));
}

#[test]
fn test_invite_retransmission_replays_the_last_provisional() {
    let mut alice = alice();
    let mut bob = bob();
    alice.invite(bob_uri(), RequestOptions::default()).unwrap();
    let sent = outgoing(&mut alice);
    bob.receive_message(sent[0].clone());
    let server = server_key(&bob.take_events());
    bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    assert_eq!(statuses(&outgoing(&mut bob)), vec![180]);

    bob.receive_message(sent[0].clone());
    assert_eq!(statuses(&outgoing(&mut bob)), vec![180]);
    assert!(bob.take_events().is_empty());
    assert_eq!(bob.server_count(), 1);
}

#[test]
fn test_reinvite_glare_is_refused_and_rolled_back() {
    let mut alice = alice();
    let mut bob = bob();
    let (_, alice_dialog, bob_dialog) = establish(&mut alice, &mut bob);
    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    settle(&mut alice, &mut bob);
    alice.take_events();
    bob.take_events();

    let alice_offer = OFFER.replace("49170", "49172");
    let bob_offer = ANSWER.replace("3456", "3458");
    let alice_id = alice
        .dialog_request(&alice_dialog, Method::Invite, RequestOptions::new().with_body(sdp(&alice_offer)))
        .unwrap();
    let bob_id = bob
        .dialog_request(&bob_dialog, Method::Invite, RequestOptions::new().with_body(sdp(&bob_offer)))
        .unwrap();
    assert_eq!(
        alice.session(&alice_dialog).unwrap().signaling_state(),
        SignalingState::HaveLocalOffer
    );

    // The two re-INVITEs cross on the wire
    let from_alice = outgoing(&mut alice);
    let from_bob = outgoing(&mut bob);
    for message in from_alice {
        bob.receive_message(message);
    }
    for message in from_bob {
        alice.receive_message(message);
    }
    settle(&mut alice, &mut bob);

    assert_eq!(reject_status(&alice.take_events(), alice_id), Some(491));
    assert_eq!(reject_status(&bob.take_events(), bob_id), Some(491));
    for (core, dialog) in [(&alice, &alice_dialog), (&bob, &bob_dialog)] {
        let session = core.session(dialog).unwrap();
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert_eq!(&session.offer().unwrap().content[..], OFFER.as_bytes());
        assert!(session.dialog().is_confirmed());
    }
}

#[test]
fn test_reinvite_updates_the_session() {
    let mut alice = alice();
    let mut bob = bob();
    let (_, alice_dialog, bob_dialog) = establish(&mut alice, &mut bob);
    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    settle(&mut alice, &mut bob);
    bob.take_events();

    let new_offer = OFFER.replace("49170", "49180");
    let new_answer = ANSWER.replace("3456", "3470");
    alice
        .dialog_request(&alice_dialog, Method::Invite, RequestOptions::new().with_body(sdp(&new_offer)))
        .unwrap();
    deliver(&mut alice, &mut bob);
    let events = bob.take_events();
    let server = match &events[..] {
        [UserAgentEvent::DialogRequest { dialog, server, request }] => {
            assert_eq!(*dialog, bob_dialog);
            assert_eq!(request.cseq().seq, 2);
            server.clone()
        }
        other => panic!("unexpected events {:?}", other),
    };
    assert_eq!(
        bob.session(&bob_dialog).unwrap().signaling_state(),
        SignalingState::HaveRemoteOffer
    );
    bob.accept(&server, 200, ResponseOptions::new().with_body(sdp(&new_answer)))
        .unwrap();
    deliver(&mut bob, &mut alice);
    assert_eq!(accepted_dialog(&alice.take_events()), Some(alice_dialog.clone()));
    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    deliver(&mut alice, &mut bob);

    for (core, dialog) in [(&alice, &alice_dialog), (&bob, &bob_dialog)] {
        let session = core.session(dialog).unwrap();
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert_eq!(&session.offer().unwrap().content[..], new_offer.as_bytes());
        assert_eq!(&session.answer().unwrap().content[..], new_answer.as_bytes());
    }
    assert_eq!(bob.dialog(&bob_dialog).unwrap().remote_seq, Some(2));
}

#[test]
fn test_cancelled_reinvite_keeps_the_call() {
    let mut alice = alice();
    let mut bob = bob();
    let (_, alice_dialog, bob_dialog) = establish(&mut alice, &mut bob);
    alice.ack(&alice_dialog, RequestOptions::default()).unwrap();
    settle(&mut alice, &mut bob);
    alice.take_events();
    bob.take_events();

    let new_offer = OFFER.replace("49170", "49190");
    let id = alice
        .dialog_request(&alice_dialog, Method::Invite, RequestOptions::new().with_body(sdp(&new_offer)))
        .unwrap();
    let sent = deliver(&mut alice, &mut bob);
    let reinvite = requests(&sent, Method::Invite).remove(0);
    let server = server_key(&bob.take_events());
    assert_eq!(
        bob.session(&bob_dialog).unwrap().signaling_state(),
        SignalingState::HaveRemoteOffer
    );

    bob.receive_message(create_cancel(&reinvite).into());
    let replies = outgoing(&mut bob);
    let mut codes = statuses(&replies);
    codes.sort_unstable();
    assert_eq!(codes, vec![200, 487]);
    let events = bob.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, UserAgentEvent::Cancelled { server: key, .. } if *key == server)));
    assert!(terminations(&events).is_empty());

    for reply in replies {
        alice.receive_message(reply);
    }
    let events = alice.take_events();
    assert_eq!(reject_status(&events, id), Some(487));
    assert!(terminations(&events).is_empty());
    assert_eq!(requests(&outgoing(&mut alice), Method::Ack).len(), 1);

    // Only the re-INVITE failed: both sides keep the call and the old session
    for (core, dialog) in [(&alice, &alice_dialog), (&bob, &bob_dialog)] {
        let session = core.session(dialog).unwrap();
        assert!(session.dialog().is_confirmed());
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert_eq!(&session.offer().unwrap().content[..], OFFER.as_bytes());
    }
    assert_eq!(bob.dialog_count(), 1);
}

#[test]
fn test_missing_ack_tears_the_call_down() {
    let mut alice = alice();
    let mut bob = bob();
    let (_, _, bob_dialog) = establish(&mut alice, &mut bob);
    bob.take_events();

    // 2xx retransmissions start at T1
    advance(&mut bob, Duration::from_millis(600));
    assert_eq!(statuses(&outgoing(&mut bob)), vec![200]);

    advance(&mut bob, Duration::from_secs(33));
    // The BYE itself is retransmitted within the window
    let byes = requests(&outgoing(&mut bob), Method::Bye);
    assert!(!byes.is_empty());
    assert!(byes.iter().all(|bye| bye.cseq() == byes[0].cseq()));
    assert_eq!(
        terminations(&bob.take_events()),
        vec![(bob_dialog.clone(), TerminationReason::AckTimeout)]
    );
    assert!(bob.dialog(&bob_dialog).is_none());
}

#[test]
fn test_reliable_provisional_with_prack() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());

    let ringing = bob
        .progress(&server, 183, ResponseOptions::new().reliable().with_body(sdp(ANSWER)))
        .unwrap();
    assert!(ringing.headers.has_option_tag(&HeaderName::Require, "100rel"));
    assert!(ringing.headers.get(&HeaderName::RSeq).is_some());
    let bob_dialog = DialogId::from_outgoing_response(&ringing).unwrap();
    assert_eq!(
        bob.session(&bob_dialog).unwrap().signaling_state(),
        SignalingState::Stable
    );

    deliver(&mut bob, &mut alice);
    let alice_dialog = alice
        .take_events()
        .iter()
        .find_map(|e| match e {
            UserAgentEvent::Outgoing {
                id: event_id,
                event: OutgoingEvent::Progress { dialog, .. },
            } if *event_id == id => dialog.clone(),
            _ => None,
        })
        .unwrap();
    let session = alice.session(&alice_dialog).unwrap();
    assert!(session.needs_prack());
    assert_eq!(session.signaling_state(), SignalingState::Stable);

    alice.prack(&alice_dialog, RequestOptions::default()).unwrap();
    let sent = deliver(&mut alice, &mut bob);
    let prack = requests(&sent, Method::Prack).remove(0);
    assert!(prack.headers.get(&HeaderName::RAck).is_some());
    assert!(bob
        .take_events()
        .iter()
        .any(|e| matches!(e, UserAgentEvent::PrackReceived { dialog, .. } if *dialog == bob_dialog)));
    assert_eq!(statuses(&deliver(&mut bob, &mut alice)), vec![200]);

    // PRACKed: no retransmission, no 504
    advance(&mut bob, Duration::from_secs(40));
    assert!(!statuses(&outgoing(&mut bob)).contains(&183));
    assert!(bob.dialog(&bob_dialog).is_some());
}

#[test]
fn test_unacknowledged_reliable_provisional_fails_the_invite() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice.invite(bob_uri(), RequestOptions::default()).unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());
    let ringing = bob
        .progress(&server, 180, ResponseOptions::new().reliable())
        .unwrap();
    let bob_dialog = DialogId::from_outgoing_response(&ringing).unwrap();
    outgoing(&mut bob);

    advance(&mut bob, Duration::from_secs(33));
    let sent = outgoing(&mut bob);
    assert!(statuses(&sent).contains(&180));
    assert!(statuses(&sent).contains(&504));
    assert_eq!(
        terminations(&bob.take_events()),
        vec![(bob_dialog, TerminationReason::Failed)]
    );

    for message in sent {
        alice.receive_message(message);
    }
    assert_eq!(reject_status(&alice.take_events(), id), Some(504));
}

#[test]
fn test_reliable_provisional_needs_peer_support() {
    let mut alice = UserAgentCore::new(
        UserAgentCoreConfig::builder(
            "sip:alice@atlanta.example.com".parse().unwrap(),
            "sip:alice@192.0.2.1:5060".parse().unwrap(),
        )
        .with_supported_option_tags(Vec::new())
        .build()
        .unwrap(),
    )
    .unwrap();
    let mut bob = bob();
    alice.invite(bob_uri(), RequestOptions::default()).unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());

    let result = bob.progress(&server, 180, ResponseOptions::new().reliable());
    assert!(matches!(result, Err(DialogError::Protocol { .. })));
    // Unreliably it still rings
    bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    assert_eq!(statuses(&outgoing(&mut bob)), vec![180]);
}

#[test]
fn test_illegal_operations_are_refused() {
    let mut alice = alice();
    let mut bob = bob();
    let id = alice.invite(bob_uri(), RequestOptions::default()).unwrap();
    deliver(&mut alice, &mut bob);
    let server = server_key(&bob.take_events());
    let ringing = bob.progress(&server, 180, ResponseOptions::default()).unwrap();
    let bob_dialog = DialogId::from_outgoing_response(&ringing).unwrap();

    // BYE needs a confirmed dialog
    assert!(bob.bye(&bob_dialog).unwrap_err().is_state_error());
    // Status outside the operation's class
    assert!(bob.accept(&server, 486, ResponseOptions::default()).is_err());

    bob.reject(&server, 486, ResponseOptions::default()).unwrap();
    assert!(bob.dialog(&bob_dialog).is_none());
    // Already answered
    assert!(bob
        .accept(&server, 200, ResponseOptions::default())
        .unwrap_err()
        .is_state_error());

    let unknown = DialogId::new("nope", "a", "b");
    assert!(matches!(
        alice.ack(&unknown, RequestOptions::default()),
        Err(DialogError::NotFound { .. })
    ));
    assert!(matches!(
        alice.request(Method::Bye, bob_uri(), RequestOptions::default()),
        Err(DialogError::Protocol { .. })
    ));

    settle(&mut bob, &mut alice);
    assert_eq!(reject_status(&alice.take_events(), id), Some(486));
    // Too late to cancel: accepted, but nothing is sent
    alice.cancel(&id).unwrap();
    assert!(requests(&outgoing(&mut alice), Method::Cancel).is_empty());
}
