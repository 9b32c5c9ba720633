//! Timer support for transactions and dialogs.
//!
//! RFC 3261 defines the transaction timers (A through K, plus L and M from
//! RFC 6026). Dialogs add their own for 2xx and reliable provisional
//! retransmission and for subscriptions.
//!
//! # Model
//!
//! ```text
//! ┌──────────────┐  schedule(deadline, target)  ┌────────────────┐
//! │ Transaction  │─────────────────────────────▶│ TimerScheduler │
//! │   / Dialog   │◀─────── TimerToken ──────────│                │
//! └──────────────┘                              └───────┬────────┘
//!        ▲                                              │ expire(now)
//!        │        on_timer(TimerType / DialogTimer)     ▼
//!        └──────────────────────────────────────  UserAgentCore
//! ```
//!
//! The scheduler is a plain deadline queue. The user agent core drains it
//! and routes each expiry by its [`TimerTarget`].

pub mod scheduler;
pub mod types;

pub use scheduler::{ExpiredTimer, TimerScheduler, TimerToken};
pub use types::{DialogTimer, TimerSettings, TimerTarget, TimerType, TRYING_DELAY};
