//! Dialog identification (RFC 3261 §12)

use std::fmt;

use serde::{Deserialize, Serialize};

use sipflow_sip_core::{Request, Response};

/// Call-ID plus the local and remote tags, as seen from this user agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Id of the dialog an incoming in-dialog request belongs to
    /// (local = To-tag, remote = From-tag)
    pub fn from_incoming_request(request: &Request) -> Option<Self> {
        Some(Self::new(request.call_id(), request.to_tag()?, request.from_tag()?))
    }

    /// Id of the dialog a response to our request establishes or belongs to
    /// (local = From-tag, remote = To-tag)
    pub fn from_incoming_response(response: &Response) -> Option<Self> {
        Some(Self::new(
            response.call_id(),
            response.headers.from_tag()?,
            response.to_tag()?,
        ))
    }

    /// Id of the dialog a response we send establishes
    /// (local = To-tag, remote = From-tag)
    pub fn from_outgoing_response(response: &Response) -> Option<Self> {
        Some(Self::new(
            response.call_id(),
            response.to_tag()?,
            response.headers.from_tag()?,
        ))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}
