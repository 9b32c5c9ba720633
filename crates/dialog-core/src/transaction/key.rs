//! Transaction identification (RFC 3261 §17.1.3 and §17.2.3)
//!
//! A transaction is identified by the branch parameter of the top Via, the
//! method, and which side of the exchange we are on. An ACK matches the
//! INVITE transaction it acknowledges; a CANCEL carries the branch of the
//! request it cancels but forms a transaction of its own.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use sipflow_sip_core::{Method, Request, Response};

/// Uniquely identifies a transaction
#[derive(Clone, Serialize, Deserialize)]
pub struct TransactionKey {
    /// Branch parameter of the topmost Via
    pub branch: String,

    /// Method of the transaction. ACK is folded into INVITE.
    pub method: Method,

    /// `true` for server transactions
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Server-side key for an incoming request.
    ///
    /// Returns `None` when the top Via carries no branch.
    pub fn from_request(request: &Request) -> Option<Self> {
        let branch = request.branch().filter(|b| !b.is_empty())?;
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref m => m.clone(),
        };
        Some(Self::new(branch, method, true))
    }

    /// Client-side key for an incoming response, using the CSeq method
    pub fn from_response(response: &Response) -> Option<Self> {
        let branch = response.branch().filter(|b| !b.is_empty())?;
        Some(Self::new(branch, response.cseq().method.clone(), false))
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Same branch and side, different method (CANCEL to INVITE lookups)
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            branch: self.branch.clone(),
            method,
            is_server: self.is_server,
        }
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_server { "server" } else { "client" };
        write!(f, "Key({}:{}:{})", self.branch, self.method, side)
    }
}

impl PartialEq for TransactionKey {
    fn eq(&self, other: &Self) -> bool {
        self.branch == other.branch && self.method == other.method && self.is_server == other.is_server
    }
}

impl Eq for TransactionKey {}

impl Hash for TransactionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.hash(state);
        self.is_server.hash(state);
    }
}

/// Alias kept for call sites that talk about server transaction ids
pub type TransactionId = TransactionKey;

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;
    use std::collections::HashSet;

    fn request(method: Method, branch: &str) -> Request {
        let from = NameAddr::new("sip:alice@localhost".parse().unwrap()).with_tag("a");
        let to = NameAddr::new("sip:bob@localhost".parse().unwrap());
        let mut headers = MessageHeaders::new(from, to, "callid-test-key", CSeq::new(1, method.clone()));
        headers.via.push(Via::new("UDP", "client.example.com", Some(5060), branch));
        Request::new(method, "sip:bob@localhost".parse().unwrap(), headers)
    }

    #[test]
    fn test_ack_folds_into_invite_key() {
        let invite = TransactionKey::from_request(&request(Method::Invite, "z9hG4bK1")).unwrap();
        let ack = TransactionKey::from_request(&request(Method::Ack, "z9hG4bK1")).unwrap();
        assert_eq!(invite, ack);
        assert!(invite.is_server());
    }

    #[test]
    fn test_cancel_has_its_own_key() {
        let invite = TransactionKey::from_request(&request(Method::Invite, "z9hG4bK1")).unwrap();
        let cancel = TransactionKey::from_request(&request(Method::Cancel, "z9hG4bK1")).unwrap();
        assert_ne!(invite, cancel);
        assert_eq!(cancel.with_method(Method::Invite), invite);
    }

    #[test]
    fn test_response_key_uses_cseq_method() {
        let req = request(Method::Options, "z9hG4bK2");
        let resp = Response::for_request(StatusCode::OK, &req);
        let key = TransactionKey::from_response(&resp).unwrap();
        assert_eq!(key, TransactionKey::new("z9hG4bK2", Method::Options, false));

        let mut set = HashSet::new();
        set.insert(key.clone());
        set.insert(key.with_method(Method::Options));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_missing_branch() {
        assert!(TransactionKey::from_request(&request(Method::Invite, "")).is_none());
        assert_eq!(
            TransactionKey::new("z9hG4bK3", Method::Invite, false).to_string(),
            "Key(z9hG4bK3:INVITE:client)"
        );
    }
}
