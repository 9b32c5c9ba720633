use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportProtocol, TransportState};

// Maximum UDP packet size
const MAX_UDP_PACKET_SIZE: usize = 65_507;
// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// UDP transport connected to a single remote peer
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: watch::Sender<TransportState>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Binds `local`, connects the socket to `remote` and starts receiving
    pub async fn connect_to(
        local: SocketAddr,
        remote: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(local).await.map_err(|e| Error::BindFailed(local, e))?;
        let local_addr = socket.local_addr()?;
        socket.connect(remote).await.map_err(|e| Error::ConnectFailed(remote, e))?;
        info!("SIP UDP transport {} connected to {}", local_addr, remote);

        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(TransportState::Connected);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                local_addr,
                remote_addr: remote,
                state,
                events_tx,
            }),
        };
        transport.spawn_receive_loop();

        Ok((transport, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    // Receives datagrams until the transport leaves the Connected state
    fn spawn_receive_loop(&self) {
        let socket = self.inner.socket.clone();
        let events_tx = self.inner.events_tx.clone();
        let mut state_rx = self.inner.state.subscribe();
        let local_addr = self.inner.local_addr;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() || *state_rx.borrow() != TransportState::Connected {
                            break;
                        }
                    }
                    result = socket.recv(&mut buf) => match result {
                        Ok(len) => {
                            trace!("Received {} bytes on {}", len, local_addr);
                            let event = TransportEvent::MessageReceived(Bytes::copy_from_slice(&buf[..len]));
                            if events_tx.send(event).await.is_err() {
                                debug!("Event receiver dropped, stopping UDP receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Error receiving UDP packet: {}", e);
                            let _ = events_tx
                                .send(TransportEvent::Error {
                                    error: format!("Error receiving packet: {}", e),
                                })
                                .await;
                        }
                    },
                }
            }
            info!("UDP receive loop on {} terminated", local_addr);
        });
    }

    async fn set_state(&self, state: TransportState) {
        if self.inner.state.send_replace(state) != state {
            let _ = self.inner.events_tx.send(TransportEvent::StateChanged(state)).await;
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    async fn connect(&self) -> Result<()> {
        if self.state() == TransportState::Connected {
            return Ok(());
        }
        self.set_state(TransportState::Connecting).await;
        if let Err(e) = self.inner.socket.connect(self.inner.remote_addr).await {
            self.set_state(TransportState::Disconnected).await;
            return Err(Error::ConnectFailed(self.inner.remote_addr, e));
        }
        self.set_state(TransportState::Connected).await;
        self.spawn_receive_loop();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.set_state(TransportState::Disconnecting).await;
        self.set_state(TransportState::Disconnected).await;
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(Error::NotConnected(state));
        }
        if data.len() > MAX_UDP_PACKET_SIZE {
            return Err(Error::MessageTooLarge(data.len()));
        }
        debug!("Sending {} byte message to {}", data.len(), self.inner.remote_addr);
        self.inner.socket.send(&data).await?;
        Ok(())
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({} -> {})", self.inner.local_addr, self.inner.remote_addr)
    }
}
