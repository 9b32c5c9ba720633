//! # sipflow dialog-core
//!
//! RFC 3261 transaction, dialog and user agent layers for the sipflow SIP
//! stack.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ runner       UserAgent task + UserAgentHandle (tokio)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ core         UserAgentCore: routing, dialog ownership    │
//! ├──────────────────────────────────────────────────────────┤
//! │ user_agent   UserAgentClient / UserAgentServer           │
//! ├──────────────────────────────────────────────────────────┤
//! │ dialog       Dialog, SessionDialog, SubscriptionDialog   │
//! ├──────────────────────────────────────────────────────────┤
//! │ transaction  ICT / IST / NICT / NIST + TimerScheduler    │
//! └──────────────────────────────────────────────────────────┘
//!        messages: sipflow-sip-core   bytes: sipflow-sip-transport
//! ```
//!
//! Everything below the runner is synchronous and performs no I/O: state
//! machines queue outgoing messages and timers in an
//! [`IoContext`](transaction::IoContext), and the core reports to the
//! application through [`UserAgentEvent`](events::UserAgentEvent)s. The
//! runner owns the core on one tokio task and connects it to a
//! [`Transport`](sipflow_sip_transport::Transport) and the clock.
//!
//! ## Driving the core directly
//!
//! ```rust
//! use sipflow_dialog_core::prelude::*;
//!
//! let config = UserAgentCoreConfig::builder(
//!     "sip:alice@atlanta.example.com".parse().unwrap(),
//!     "sip:alice@192.0.2.1:5060".parse().unwrap(),
//! )
//! .build()
//! .unwrap();
//! let mut core = UserAgentCore::new(config).unwrap();
//!
//! let id = core
//!     .invite("sip:bob@biloxi.example.com".parse().unwrap(), RequestOptions::default())
//!     .unwrap();
//! let outgoing = core.take_outgoing();
//! assert_eq!(outgoing.len(), 1);
//! assert!(core.client(&id).is_some());
//! ```

pub mod config;
pub mod core;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod logging;
pub mod runner;
pub mod transaction;
pub mod user_agent;

#[cfg(test)]
mod test_utils;

pub use config::{Credentials, UserAgentCoreConfig};
pub use crate::core::{DialogEntry, UserAgentCore};
pub use dialog::{Dialog, DialogId, SessionDialog, SignalingState, SubscriptionDialog, SubscriptionState};
pub use errors::{DialogError, DialogResult, TransactionError, TransactionResult};
pub use events::{OutgoingEvent, RejectCause, TerminationReason, UserAgentEvent};
pub use logging::{setup_logging, LoggingConfig};
pub use runner::{UserAgent, UserAgentHandle};
pub use transaction::{TimerSettings, TransactionKey};
pub use user_agent::{Body, ClientId, RequestOptions, ResponseOptions};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Body, ClientId, Credentials, Dialog, DialogError, DialogId, DialogResult, LoggingConfig, OutgoingEvent,
        RejectCause, RequestOptions, ResponseOptions, SessionDialog, SignalingState, SubscriptionDialog,
        SubscriptionState, TerminationReason, TimerSettings, TransactionKey, UserAgent, UserAgentCore,
        UserAgentCoreConfig, UserAgentEvent, UserAgentHandle,
    };
    pub use sipflow_sip_core::prelude::*;
}
