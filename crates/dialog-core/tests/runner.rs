//! User agents on tokio tasks, connected by an in-memory transport

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sipflow_dialog_core::prelude::*;
use sipflow_sip_transport::ChannelTransport;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

fn spawn_pair() -> (UserAgent, UserAgent, ChannelTransport) {
    let ((a, a_events), (b, b_events)) = ChannelTransport::pair();
    let alice = UserAgent::spawn(
        UserAgentCore::new(alice_config()).unwrap(),
        Arc::new(a.clone()),
        a_events,
    );
    let bob = UserAgent::spawn(UserAgentCore::new(bob_config()).unwrap(), Arc::new(b), b_events);
    (alice, bob, a)
}

/// Skips events until one matches
async fn wait_for<F>(agent: &mut UserAgent, mut wanted: F) -> UserAgentEvent
where
    F: FnMut(&UserAgentEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(120), agent.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("runner stopped");
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_call_between_running_agents() {
    let (mut alice, mut bob, _) = spawn_pair();
    let id = alice
        .handle()
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .await
        .unwrap();

    let server = match wait_for(&mut bob, |e| matches!(e, UserAgentEvent::Invite { .. })).await {
        UserAgentEvent::Invite { server, request } => {
            assert_eq!(&request.body[..], OFFER.as_bytes());
            server
        }
        _ => unreachable!(),
    };
    bob.handle()
        .accept(server, 200, ResponseOptions::new().with_body(sdp(ANSWER)))
        .await
        .unwrap();

    let dialog = match wait_for(&mut alice, |e| {
        matches!(e, UserAgentEvent::Outgoing { event: OutgoingEvent::Accept { .. }, .. })
    })
    .await
    {
        UserAgentEvent::Outgoing {
            id: event_id,
            event: OutgoingEvent::Accept { dialog: Some(dialog), .. },
        } => {
            assert_eq!(event_id, id);
            dialog
        }
        other => panic!("unexpected event {:?}", other),
    };
    alice.handle().ack(dialog.clone(), RequestOptions::default()).await.unwrap();
    wait_for(&mut bob, |e| matches!(e, UserAgentEvent::AckReceived { .. })).await;
    assert_eq!(bob.handle().dialog_count().await.unwrap(), 1);

    alice.handle().bye(dialog.clone()).await.unwrap();
    let ended = wait_for(&mut bob, |e| matches!(e, UserAgentEvent::DialogTerminated { .. })).await;
    assert!(matches!(
        ended,
        UserAgentEvent::DialogTerminated { reason: TerminationReason::RemoteBye, .. }
    ));
    let ended = wait_for(&mut alice, |e| matches!(e, UserAgentEvent::DialogTerminated { .. })).await;
    assert_eq!(
        ended,
        UserAgentEvent::DialogTerminated { dialog, reason: TerminationReason::LocalBye }
    );
    assert_eq!(bob.handle().dialog_count().await.unwrap(), 0);

    assert_ok!(alice.shutdown().await);
    assert_ok!(bob.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_rejects_the_request() {
    let (mut alice, _bob, transport) = spawn_pair();
    transport.set_fail_sends(true);

    let id = alice
        .handle()
        .request(Method::Options, bob_uri(), RequestOptions::default())
        .await
        .unwrap();
    match wait_for(&mut alice, |e| matches!(e, UserAgentEvent::Outgoing { .. })).await {
        UserAgentEvent::Outgoing {
            id: event_id,
            event: OutgoingEvent::Reject(cause),
        } => {
            assert_eq!(event_id, id);
            assert_eq!(cause, RejectCause::TransportError);
            assert_eq!(cause.status(), 503);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let clients = alice.handle().call(|core| core.client_count()).await.unwrap();
    assert_eq!(clients, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timers_run_without_traffic() {
    let ((a, a_events), (_silent, _silent_events)) = ChannelTransport::pair();
    let mut alice = UserAgent::spawn(UserAgentCore::new(alice_config()).unwrap(), Arc::new(a), a_events);
    let id = alice
        .handle()
        .invite(bob_uri(), RequestOptions::new().with_body(sdp(OFFER)))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    match wait_for(&mut alice, |e| matches!(e, UserAgentEvent::Outgoing { .. })).await {
        UserAgentEvent::Outgoing {
            id: event_id,
            event: OutgoingEvent::Reject(RejectCause::Timeout),
        } => assert_eq!(event_id, id),
        other => panic!("unexpected event {:?}", other),
    }
    // Timer B, 64 * T1
    assert!(started.elapsed() >= Duration::from_secs(32));
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let (alice, _bob, _) = spawn_pair();
    let handle = alice.handle();
    assert!(handle.is_running());

    assert_ok!(alice.shutdown().await);
    assert!(!handle.is_running());
    let refused = assert_err!(handle.request(Method::Options, bob_uri(), RequestOptions::default()).await);
    assert!(matches!(refused, DialogError::Shutdown));
}
