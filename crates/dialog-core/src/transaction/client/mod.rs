//! Client transactions

pub mod invite;
pub mod non_invite;

pub use invite::InviteClientTransaction;
pub use non_invite::NonInviteClientTransaction;

use sipflow_sip_core::{Request, Response};

use crate::errors::TransactionResult;
use crate::transaction::{
    Transaction, TransactionEvent, TransactionIo, TransactionKey, TransactionKind, TransactionState, TimerSettings,
    TimerType,
};

/// Either client state machine, as owned by a user agent client
#[derive(Debug)]
pub enum ClientTransaction {
    Invite(InviteClientTransaction),
    NonInvite(NonInviteClientTransaction),
}

impl ClientTransaction {
    /// Picks the state machine matching the request method
    pub fn new(request: Request, reliable: bool, settings: TimerSettings, max_forks: usize) -> TransactionResult<Self> {
        if request.method == sipflow_sip_core::Method::Invite {
            InviteClientTransaction::new(request, reliable, settings, max_forks).map(ClientTransaction::Invite)
        } else {
            NonInviteClientTransaction::new(request, reliable, settings).map(ClientTransaction::NonInvite)
        }
    }

    pub fn start(&mut self, io: &mut dyn TransactionIo) -> TransactionResult<()> {
        match self {
            ClientTransaction::Invite(tx) => tx.start(io),
            ClientTransaction::NonInvite(tx) => tx.start(io),
        }
    }

    pub fn receive_response(
        &mut self,
        response: Response,
        io: &mut dyn TransactionIo,
    ) -> TransactionResult<Vec<TransactionEvent>> {
        match self {
            ClientTransaction::Invite(tx) => tx.receive_response(response, io),
            ClientTransaction::NonInvite(tx) => tx.receive_response(response, io),
        }
    }

    pub fn as_invite_mut(&mut self) -> Option<&mut InviteClientTransaction> {
        match self {
            ClientTransaction::Invite(tx) => Some(tx),
            ClientTransaction::NonInvite(_) => None,
        }
    }

    fn inner(&self) -> &dyn Transaction {
        match self {
            ClientTransaction::Invite(tx) => tx,
            ClientTransaction::NonInvite(tx) => tx,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transaction {
        match self {
            ClientTransaction::Invite(tx) => tx,
            ClientTransaction::NonInvite(tx) => tx,
        }
    }
}

impl Transaction for ClientTransaction {
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
