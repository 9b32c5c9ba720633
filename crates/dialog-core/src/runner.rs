//! # Async runner
//!
//! [`UserAgent`] puts a [`UserAgentCore`] on a tokio task. The task is the
//! only owner of the core and serialises everything that touches it:
//!
//! ```text
//!   transport events ──┐
//!   handle commands  ──┼──► select! ──► UserAgentCore ──► outbox ──► Transport::send
//!   next timer       ──┘                     │                 (failure ──► transport_error)
//!                                            └──► events ──► application receiver
//! ```
//!
//! The clock handed to the core is `tokio::time::Instant`, so tests can run
//! with a paused runtime and let timers elapse instantly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sipflow_dialog_core::prelude::*;
//! use sipflow_sip_transport::ChannelTransport;
//!
//! # async fn example() -> DialogResult<()> {
//! let ((transport, transport_events), _peer) = ChannelTransport::pair();
//! let config = UserAgentCoreConfig::builder(
//!     "sip:alice@atlanta.example.com".parse()?,
//!     "sip:alice@192.0.2.1:5060".parse()?,
//! )
//! .build()?;
//! let mut agent = UserAgent::spawn(UserAgentCore::new(config)?, Arc::new(transport), transport_events);
//! let handle = agent.handle();
//! handle.invite("sip:bob@biloxi.example.com".parse()?, RequestOptions::default()).await?;
//! while let Some(event) = agent.next_event().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use sipflow_sip_core::prelude::*;
use sipflow_sip_transport::{Transport, TransportEvent};

use crate::core::UserAgentCore;
use crate::dialog::{DialogId, SubscriptionState};
use crate::errors::{DialogError, DialogResult};
use crate::events::UserAgentEvent;
use crate::transaction::TransactionKey;
use crate::user_agent::{ClientId, RequestOptions, ResponseOptions};

const COMMAND_CHANNEL_CAPACITY: usize = 100;

type CoreFn = Box<dyn FnOnce(&mut UserAgentCore) + Send>;

enum Command {
    Run(CoreFn),
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run(_) => f.write_str("Run"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A running user agent
#[derive(Debug)]
pub struct UserAgent {
    handle: UserAgentHandle,
    events: mpsc::UnboundedReceiver<UserAgentEvent>,
    task: JoinHandle<()>,
}

impl UserAgent {
    /// Spawns the runner task. `transport_events` is the receiver handed
    /// out when `transport` was created.
    pub fn spawn(
        core: UserAgentCore,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        if transport.is_reliable() != core.config().reliable_transport {
            warn!(
                transport = %transport.protocol(),
                configured = core.config().reliable_transport,
                "Transport reliability differs from the configuration"
            );
        }
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            core,
            transport,
            transport_events,
            commands: command_rx,
            events: event_tx,
        };
        let task = tokio::spawn(runner.run());
        UserAgent {
            handle: UserAgentHandle { commands: command_tx },
            events: event_rx,
            task,
        }
    }

    pub fn handle(&self) -> UserAgentHandle {
        self.handle.clone()
    }

    /// Next application event; `None` once the runner has stopped
    pub async fn next_event(&mut self) -> Option<UserAgentEvent> {
        self.events.recv().await
    }

    /// Event already queued, without waiting
    pub fn try_next_event(&mut self) -> Option<UserAgentEvent> {
        self.events.try_recv().ok()
    }

    /// Parts for applications that consume events on another task
    pub fn into_parts(self) -> (UserAgentHandle, mpsc::UnboundedReceiver<UserAgentEvent>, JoinHandle<()>) {
        (self.handle, self.events, self.task)
    }

    /// Stops the runner and waits for it
    pub async fn shutdown(self) -> DialogResult<()> {
        self.handle.shutdown().await?;
        self.task.await.map_err(|e| DialogError::invalid_state(format!("runner task failed: {}", e)))
    }
}

/// Cloneable access to a running [`UserAgent`]. Every call runs on the
/// runner task against the core and returns its result.
#[derive(Debug, Clone)]
pub struct UserAgentHandle {
    commands: mpsc::Sender<Command>,
}

impl UserAgentHandle {
    /// Runs `f` on the core
    pub async fn call<R, F>(&self, f: F) -> DialogResult<R>
    where
        F: FnOnce(&mut UserAgentCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Run(Box::new(move |core| {
            let _ = reply_tx.send(f(core));
        }));
        self.commands
            .send(command)
            .await
            .map_err(|_| DialogError::Shutdown)?;
        reply_rx.await.map_err(|_| DialogError::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub async fn shutdown(&self) -> DialogResult<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| DialogError::Shutdown)
    }

    pub async fn invite(&self, target: Uri, options: RequestOptions) -> DialogResult<ClientId> {
        self.call(move |core| core.invite(target, options)).await?
    }

    pub async fn request(&self, method: Method, target: Uri, options: RequestOptions) -> DialogResult<ClientId> {
        self.call(move |core| core.request(method, target, options)).await?
    }

    pub async fn subscribe(
        &self,
        target: Uri,
        event: impl Into<String>,
        expires: u32,
        options: RequestOptions,
    ) -> DialogResult<ClientId> {
        let event = event.into();
        self.call(move |core| core.subscribe(target, &event, expires, options))
            .await?
    }

    pub async fn cancel(&self, id: ClientId) -> DialogResult<()> {
        self.call(move |core| core.cancel(&id)).await?
    }

    pub async fn ack(&self, dialog: DialogId, options: RequestOptions) -> DialogResult<()> {
        self.call(move |core| core.ack(&dialog, options)).await?
    }

    pub async fn bye(&self, dialog: DialogId) -> DialogResult<ClientId> {
        self.call(move |core| core.bye(&dialog)).await?
    }

    pub async fn dialog_request(&self, dialog: DialogId, method: Method, options: RequestOptions) -> DialogResult<ClientId> {
        self.call(move |core| core.dialog_request(&dialog, method, options))
            .await?
    }

    pub async fn prack(&self, dialog: DialogId, options: RequestOptions) -> DialogResult<ClientId> {
        self.call(move |core| core.prack(&dialog, options)).await?
    }

    pub async fn notify(&self, dialog: DialogId, state: SubscriptionState, options: RequestOptions) -> DialogResult<ClientId> {
        self.call(move |core| core.notify(&dialog, state, options)).await?
    }

    pub async fn unsubscribe(&self, dialog: DialogId) -> DialogResult<ClientId> {
        self.call(move |core| core.unsubscribe(&dialog)).await?
    }

    pub async fn trying(&self, server: TransactionKey) -> DialogResult<()> {
        self.call(move |core| core.trying(&server)).await?
    }

    pub async fn progress(&self, server: TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        self.call(move |core| core.progress(&server, status, options)).await?
    }

    pub async fn accept(&self, server: TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        self.call(move |core| core.accept(&server, status, options)).await?
    }

    pub async fn redirect(&self, server: TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        self.call(move |core| core.redirect(&server, status, options)).await?
    }

    pub async fn reject(&self, server: TransactionKey, status: u16, options: ResponseOptions) -> DialogResult<Response> {
        self.call(move |core| core.reject(&server, status, options)).await?
    }

    pub async fn dialog_count(&self) -> DialogResult<usize> {
        self.call(|core| core.dialog_count()).await
    }
}

struct Runner {
    core: UserAgentCore,
    transport: Arc<dyn Transport>,
    transport_events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<UserAgentEvent>,
}

impl Runner {
    async fn run(mut self) {
        info!(aor = %self.core.config().aor, transport = %self.transport.protocol(), "User agent started");
        loop {
            let deadline = self.core.next_timer_deadline();
            // Only polled when a timer is pending
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Run(f)) => {
                        self.core.set_now(Instant::now());
                        f(&mut self.core);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = self.transport_events.recv() => match event {
                    Some(TransportEvent::MessageReceived(data)) => {
                        self.core.set_now(Instant::now());
                        trace!(len = data.len(), "Received message");
                        self.core.receive_bytes(&data);
                    }
                    Some(TransportEvent::StateChanged(state)) => {
                        debug!(%state, "Transport state changed");
                    }
                    Some(TransportEvent::Error { error }) => {
                        warn!(%error, "Transport receive error");
                    }
                    None => {
                        info!("Transport closed");
                        break;
                    }
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {
                    let fired = self.core.fire_timers(Instant::now());
                    trace!(fired, "Timers fired");
                }
            }

            self.flush().await;
            if !self.deliver_events() {
                debug!("Event receiver dropped");
            }
        }
        info!(
            dialogs = self.core.dialog_count(),
            clients = self.core.client_count(),
            servers = self.core.server_count(),
            "User agent stopped"
        );
    }

    /// Sends everything queued, feeding failures back into the core until
    /// nothing new is queued
    async fn flush(&mut self) {
        loop {
            let outgoing = self.core.take_outgoing();
            if outgoing.is_empty() {
                return;
            }
            for out in outgoing {
                if let Err(e) = self.transport.send(out.message.to_bytes()).await {
                    error!(error = %e, origin = ?out.origin, "Send failed");
                    self.core.transport_error(out.origin.as_ref());
                }
            }
        }
    }

    fn deliver_events(&mut self) -> bool {
        let mut delivered = true;
        for event in self.core.take_events() {
            if self.events.send(event).is_err() {
                delivered = false;
            }
        }
        delivered
    }
}
