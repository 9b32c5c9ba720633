//! Options accepted by user agent operations

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sipflow_sip_core::{HeaderName, NameAddr, Request, Response};

/// A message body with its content type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub content_type: String,
    pub content: Bytes,
}

impl Body {
    pub fn new(content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    /// `application/sdp` body
    pub fn sdp(content: impl Into<Bytes>) -> Self {
        Self::new("application/sdp", content)
    }
}

/// Extra content for an outgoing request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub body: Option<Body>,
    /// Headers appended verbatim
    pub extra_headers: Vec<(HeaderName, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    pub(crate) fn apply(&self, request: &mut Request) {
        for (name, value) in &self.extra_headers {
            request.headers.append(name.clone(), value.clone());
        }
        if let Some(body) = &self.body {
            request.set_body(&body.content_type, body.content.clone());
        }
    }
}

/// Extra content for an outgoing response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseOptions {
    pub body: Option<Body>,
    pub extra_headers: Vec<(HeaderName, String)>,
    /// Reason phrase replacing the default one
    pub reason: Option<String>,
    /// Contacts for 3xx responses
    pub contacts: Vec<NameAddr>,
    /// Send a 1xx reliably (RFC 3262)
    pub reliable: bool,
}

impl ResponseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contacts.push(contact);
        self
    }

    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    pub(crate) fn apply(&self, response: &mut Response) {
        for (name, value) in &self.extra_headers {
            response.headers.append(name.clone(), value.clone());
        }
        if let Some(reason) = &self.reason {
            response.reason = reason.clone();
        }
        if !self.contacts.is_empty() {
            response.headers.contact = self.contacts.clone();
        }
        if let Some(body) = &self.body {
            response.set_body(&body.content_type, body.content.clone());
        }
    }
}
