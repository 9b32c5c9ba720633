//! In-memory transport pair, used to wire two user agents together inside
//! one process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportProtocol, TransportState};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// One end of an in-memory transport pair
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    reliable: bool,
    state: watch::Sender<TransportState>,
    /// Our own event channel, for state notifications
    events_tx: mpsc::Sender<TransportEvent>,
    /// The peer's event channel
    peer_tx: mpsc::Sender<TransportEvent>,
    fail_sends: AtomicBool,
}

impl ChannelTransport {
    /// Creates two connected, unreliable transports delivering to each other
    pub fn pair() -> (
        (ChannelTransport, mpsc::Receiver<TransportEvent>),
        (ChannelTransport, mpsc::Receiver<TransportEvent>),
    ) {
        Self::pair_with(false, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a pair with explicit reliability and channel capacity
    pub fn pair_with(
        reliable: bool,
        capacity: usize,
    ) -> (
        (ChannelTransport, mpsc::Receiver<TransportEvent>),
        (ChannelTransport, mpsc::Receiver<TransportEvent>),
    ) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let a = Self::new("a", reliable, a_tx.clone(), b_tx.clone());
        let b = Self::new("b", reliable, b_tx, a_tx);
        ((a, a_rx), (b, b_rx))
    }

    fn new(
        name: &str,
        reliable: bool,
        events_tx: mpsc::Sender<TransportEvent>,
        peer_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::Connected);
        ChannelTransport {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                reliable,
                state,
                events_tx,
                peer_tx,
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every following `send` fail, to exercise error paths
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::Relaxed);
    }

    async fn set_state(&self, state: TransportState) {
        if self.inner.state.send_replace(state) != state {
            trace!(transport = %self.inner.name, %state, "Channel transport state changed");
            let _ = self.inner.events_tx.send(TransportEvent::StateChanged(state)).await;
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Memory
    }

    fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    async fn connect(&self) -> Result<()> {
        if self.state() != TransportState::Connected {
            self.set_state(TransportState::Connecting).await;
            self.set_state(TransportState::Connected).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state() != TransportState::Disconnected {
            self.set_state(TransportState::Disconnecting).await;
            self.set_state(TransportState::Disconnected).await;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(Error::NotConnected(state));
        }
        if self.inner.fail_sends.load(Ordering::Relaxed) {
            return Err(Error::SendFailed("send failure injected".into()));
        }
        debug!(transport = %self.inner.name, bytes = data.len(), "Sending over channel transport");
        self.inner
            .peer_tx
            .send(TransportEvent::MessageReceived(data))
            .await
            .map_err(|_| Error::TransportClosed)
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelTransport({})", self.inner.name)
    }
}
