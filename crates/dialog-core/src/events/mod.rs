//! Events delivered to the application
//!
//! The user agent core never calls into the application. Everything it has
//! to report is queued as a [`UserAgentEvent`] and drained with
//! [`UserAgentCore::poll_event`](crate::core::UserAgentCore::poll_event)
//! (or received from the runner's event channel).
//!
//! ```text
//!   out-of-dialog request ──► Invite / Message / Notify / Refer / Register / Subscribe
//!   our request's outcome ──► Outgoing { id, Trying | Progress | Accept | Redirect | Reject }
//!   inside a dialog ────────► DialogRequest / AckReceived / PrackReceived / DialogTerminated
//!   answering failed ───────► Cancelled / ServerFailed
//! ```

use serde::{Deserialize, Serialize};

use sipflow_sip_core::{Request, Response, StatusCode};

use crate::dialog::{DialogId, SubscriptionState};
use crate::transaction::TransactionKey;
use crate::user_agent::ClientId;

/// Why an outgoing request failed
#[derive(Debug, Clone, PartialEq)]
pub enum RejectCause {
    /// A 4xx-6xx final response
    Response(Response),
    /// Timer B or F, or a 408 to a non-INVITE request
    Timeout,
    /// The transport refused the request
    TransportError,
}

impl RejectCause {
    /// Status code the failure is reported with: the response's own, 408
    /// for a timeout, 503 for a transport failure
    pub fn status(&self) -> u16 {
        match self {
            RejectCause::Response(response) => response.status.as_u16(),
            RejectCause::Timeout => StatusCode::REQUEST_TIMEOUT.as_u16(),
            RejectCause::TransportError => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        }
    }
}

/// Outcome of a request sent with one of the core's request operations
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingEvent {
    /// 100 Trying
    Trying(Response),
    /// 101-199, with the early dialog it created, if any
    Progress {
        response: Response,
        dialog: Option<DialogId>,
    },
    /// 2xx. A forked INVITE reports one per dialog.
    Accept {
        response: Response,
        dialog: Option<DialogId>,
    },
    Redirect(Response),
    Reject(RejectCause),
}

/// Why a dialog went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The peer sent BYE
    RemoteBye,
    /// We sent BYE
    LocalBye,
    /// Our 2xx was never acknowledged
    AckTimeout,
    /// The INVITE or SUBSCRIBE failed, was cancelled or timed out before
    /// confirming the dialog
    Failed,
    /// A fork released because another branch was chosen
    ForkReleased,
    /// The notifier ended the subscription or it expired
    SubscriptionEnded,
}

/// Everything the user agent core reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum UserAgentEvent {
    /// Incoming INVITE outside a dialog; answer it through `server`
    Invite { server: TransactionKey, request: Request },
    Message { server: TransactionKey, request: Request },
    Notify { server: TransactionKey, request: Request },
    Refer { server: TransactionKey, request: Request },
    Register { server: TransactionKey, request: Request },
    Subscribe { server: TransactionKey, request: Request },

    /// Progress of one of our requests
    Outgoing { id: ClientId, event: OutgoingEvent },

    /// In-dialog request (re-INVITE, UPDATE, INFO, REFER, MESSAGE, NOTIFY or
    /// SUBSCRIBE) awaiting an answer through `server`
    DialogRequest {
        dialog: DialogId,
        server: TransactionKey,
        request: Request,
    },

    /// ACK for our 2xx
    AckReceived { dialog: DialogId, request: Request },

    /// PRACK for our reliable provisional; already answered 200
    PrackReceived { dialog: DialogId, request: Request },

    /// An incoming INVITE was cancelled and answered 487
    Cancelled { server: TransactionKey, request: Request },

    /// The transport refused a response sent through `server`. The request
    /// cannot be answered any more; an early dialog it created is gone.
    ServerFailed { server: TransactionKey, request: Request },

    DialogTerminated { dialog: DialogId, reason: TerminationReason },

    /// A NOTIFY changed a subscription; already answered 200
    SubscriptionStateChanged {
        dialog: DialogId,
        state: SubscriptionState,
        request: Request,
    },
}

impl UserAgentEvent {
    /// Server transaction the application must answer, if any
    pub fn server_key(&self) -> Option<&TransactionKey> {
        match self {
            UserAgentEvent::Invite { server, .. }
            | UserAgentEvent::Message { server, .. }
            | UserAgentEvent::Notify { server, .. }
            | UserAgentEvent::Refer { server, .. }
            | UserAgentEvent::Register { server, .. }
            | UserAgentEvent::Subscribe { server, .. }
            | UserAgentEvent::DialogRequest { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Dialog the event concerns, if any
    pub fn dialog(&self) -> Option<&DialogId> {
        match self {
            UserAgentEvent::DialogRequest { dialog, .. }
            | UserAgentEvent::AckReceived { dialog, .. }
            | UserAgentEvent::PrackReceived { dialog, .. }
            | UserAgentEvent::DialogTerminated { dialog, .. }
            | UserAgentEvent::SubscriptionStateChanged { dialog, .. } => Some(dialog),
            UserAgentEvent::Outgoing {
                event: OutgoingEvent::Progress { dialog, .. } | OutgoingEvent::Accept { dialog, .. },
                ..
            } => dialog.as_ref(),
            _ => None,
        }
    }
}
