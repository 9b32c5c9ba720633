//! Error types for dialog-core
//!
//! Two families: [`TransactionError`] for the RFC 3261 §17 state machines
//! and [`DialogError`] for everything above them (dialogs, user agent
//! operations, the core router and the async runner).

pub mod dialog_errors;
pub mod transaction_errors;

pub use dialog_errors::{DialogError, DialogResult};
pub use transaction_errors::{TransactionError, TransactionResult};
