//! UDP transport against a real loopback socket.

use std::time::Duration;

use bytes::Bytes;
use sipflow_sip_transport::prelude::*;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Datagrams flow both ways between the transport and a plain socket
#[tokio::test]
async fn test_udp_round_trip() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let (transport, mut events) = UdpTransport::connect_to("127.0.0.1:0".parse().unwrap(), peer_addr, None)
        .await
        .unwrap();
    assert_eq!(transport.protocol(), TransportProtocol::Udp);
    assert!(!transport.is_reliable());

    transport.send(Bytes::from_static(b"OPTIONS")).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"OPTIONS");
    assert_eq!(from, transport.local_addr());

    peer.send_to(b"SIP/2.0 200 OK", transport.local_addr()).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Some(TransportEvent::MessageReceived(Bytes::from_static(b"SIP/2.0 200 OK"))));
}

/// After disconnect, sends fail and the state change is reported
#[tokio::test]
async fn test_udp_disconnect() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (transport, mut events) =
        UdpTransport::connect_to("127.0.0.1:0".parse().unwrap(), peer.local_addr().unwrap(), Some(8))
            .await
            .unwrap();

    transport.disconnect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert_eq!(events.recv().await, Some(TransportEvent::StateChanged(TransportState::Disconnecting)));
    assert_eq!(events.recv().await, Some(TransportEvent::StateChanged(TransportState::Disconnected)));
    assert!(matches!(
        transport.send(Bytes::from_static(b"x")).await,
        Err(Error::NotConnected(TransportState::Disconnected))
    ));

    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    transport.send(Bytes::from_static(b"again")).await.unwrap();
}
