//! # SIP Via header
//!
//! One Via entry per hop ([RFC 3261 §20.42](https://datatracker.ietf.org/doc/html/rfc3261#section-20.42)).
//! The top entry's `branch` parameter identifies the transaction.
//!
//! ```rust
//! use sipflow_sip_core::prelude::*;
//!
//! let via: Via = "SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds".parse().unwrap();
//! assert_eq!(via.transport, "UDP");
//! assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
//! assert!(via.is_rfc3261_branch());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::Params;

/// Magic cookie prefixing every RFC 3261 branch parameter
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// A single Via entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Via {
    /// Transport token such as `UDP`, `TCP` or `TLS`
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    /// Creates a Via with the given branch
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>, branch: impl Into<String>) -> Self {
        let mut params = Params::default();
        params.set("branch", Some(branch.into()));
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.set("branch", Some(branch.into()));
    }

    /// Whether the branch carries the RFC 3261 magic cookie
    pub fn is_rfc3261_branch(&self) -> bool {
        self.branch().is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    pub fn set_received(&mut self, address: impl Into<String>) {
        self.params.set("received", Some(address.into()));
    }

    /// `rport` value; `Some(None)` when present as a flag
    pub fn rport(&self) -> Option<Option<&str>> {
        self.params.get("rport")
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::headers::parse_via(s.trim())
    }
}
