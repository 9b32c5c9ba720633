//! Server transactions

pub mod invite;
pub mod non_invite;

pub use invite::InviteServerTransaction;
pub use non_invite::NonInviteServerTransaction;

use sipflow_sip_core::{Method, Request, Response};

use crate::errors::TransactionResult;
use crate::transaction::{
    Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState, TimerSettings,
    TimerType,
};

/// Either server state machine, as owned by a user agent server
#[derive(Debug)]
pub enum ServerTransaction {
    Invite(InviteServerTransaction),
    NonInvite(NonInviteServerTransaction),
}

impl ServerTransaction {
    /// Creates the state machine for a new request and starts it
    pub fn new(request: Request, reliable: bool, settings: TimerSettings, io: &mut dyn TransactionIo) -> TransactionResult<Self> {
        if request.method == Method::Invite {
            let mut tx = InviteServerTransaction::new(request, reliable, settings)?;
            tx.start(io);
            Ok(ServerTransaction::Invite(tx))
        } else {
            NonInviteServerTransaction::new(request, reliable, settings).map(ServerTransaction::NonInvite)
        }
    }

    pub fn receive_request(
        &mut self,
        request: Request,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        match self {
            ServerTransaction::Invite(tx) => tx.receive_request(request, io),
            ServerTransaction::NonInvite(tx) => tx.receive_request(request, io),
        }
    }

    pub fn respond(&mut self, response: Response, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        match self {
            ServerTransaction::Invite(tx) => tx.respond(response, io),
            ServerTransaction::NonInvite(tx) => tx.respond(response, io),
        }
    }

    fn inner(&self) -> &dyn Transaction {
        match self {
            ServerTransaction::Invite(tx) => tx,
            ServerTransaction::NonInvite(tx) => tx,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transaction {
        match self {
            ServerTransaction::Invite(tx) => tx,
            ServerTransaction::NonInvite(tx) => tx,
        }
    }
}

impl Transaction for ServerTransaction {
    fn key(&self) -> &TransactionKey {
        self.inner().key()
    }

    fn kind(&self) -> TransactionKind {
        self.inner().kind()
    }

    fn state(&self) -> TransactionState {
        self.inner().state()
    }

    fn request(&self) -> &Request {
        self.inner().request()
    }

    fn on_timer(&mut self, timer: TimerType, io: &mut dyn TransactionIo) -> TransactionResult<Vec<TransactionEvent>> {
        self.inner_mut().on_timer(timer, io)
    }

    fn on_transport_error(&mut self, io: &mut dyn TransactionIo) -> Vec<TransactionEvent> {
        self.inner_mut().on_transport_error(io)
    }

    fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.inner_mut().dispose(io)
    }
}
