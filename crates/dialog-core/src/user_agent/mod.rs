//! Transaction users
//!
//! [`UserAgentClient`] and [`UserAgentServer`] each own exactly one
//! transaction (plus, for a client, the CANCEL or authentication retry
//! transactions it spawns) and enforce what the application may do with
//! it. Dialog handling stays in the [`UserAgentCore`](crate::core::UserAgentCore).

pub mod auth;
pub mod client;
pub mod options;
pub mod server;

pub use client::{ClientId, UserAgentClient};
pub use options::{Body, RequestOptions, ResponseOptions};
pub use server::UserAgentServer;
