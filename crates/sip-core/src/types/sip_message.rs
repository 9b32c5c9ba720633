//! # SIP messages
//!
//! [`Message`] is a closed enum over [`Request`] and [`Response`]. The
//! headers every message must carry (Via, From, To, Call-ID, CSeq) and the
//! ordered address lists (Contact, Route, Record-Route) are typed fields of
//! [`MessageHeaders`]; everything else lives in the [`Headers`] multimap.
//! `Content-Length` is never stored: it is computed from the body when the
//! message is serialized.
//!
//! ```rust
//! use sipflow_sip_core::prelude::*;
//!
//! let from = NameAddr::new("sip:alice@atlanta.com".parse().unwrap()).with_tag("1928301774");
//! let to = NameAddr::new("sip:bob@biloxi.com".parse().unwrap());
//! let mut headers = MessageHeaders::new(from, to, "a84b4c76e66710", CSeq::new(1, Method::Options));
//! headers.via.push(Via::new("UDP", "pc33.atlanta.com", None, "z9hG4bK776asdhds"));
//!
//! let request = Request::new(Method::Options, "sip:bob@biloxi.com".parse().unwrap(), headers);
//! let response = Response::for_request(StatusCode::OK, &request);
//! assert_eq!(response.headers.branch(), Some("z9hG4bK776asdhds"));
//! assert!(String::from_utf8_lossy(&response.to_bytes()).starts_with("SIP/2.0 200 OK\r\n"));
//! ```

use std::fmt::{self, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::header::{HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// SIP protocol version written in every start line
pub const SIP_VERSION: &str = "SIP/2.0";

/// Header section shared by requests and responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Via entries, topmost first
    pub via: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contact: Vec<NameAddr>,
    pub route: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    /// Every other header, in message order
    pub other: Headers,
}

impl MessageHeaders {
    pub fn new(from: NameAddr, to: NameAddr, call_id: impl Into<String>, cseq: CSeq) -> Self {
        Self {
            via: Vec::new(),
            from,
            to,
            call_id: call_id.into(),
            cseq,
            contact: Vec::new(),
            route: Vec::new(),
            record_route: Vec::new(),
            other: Headers::default(),
        }
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    /// Branch parameter of the top Via
    pub fn branch(&self) -> Option<&str> {
        self.top_via().and_then(Via::branch)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    /// First value of a header held in the generic multimap
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.other.get(name)
    }

    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.other.set(name, value);
    }

    pub fn append(&mut self, name: HeaderName, value: impl Into<String>) {
        self.other.append(name, value);
    }

    /// Comma separated token values of every instance of `name`
    pub fn tokens(&self, name: &HeaderName) -> Vec<String> {
        self.other
            .get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Whether a Require/Supported style header lists `option_tag`
    pub fn has_option_tag(&self, name: &HeaderName, option_tag: &str) -> bool {
        self.tokens(name).iter().any(|t| t.eq_ignore_ascii_case(option_tag))
    }

    fn write_to(&self, out: &mut String, body: &Bytes) -> fmt::Result {
        for via in &self.via {
            write!(out, "Via: {}\r\n", via)?;
        }
        for route in &self.route {
            write!(out, "Route: {}\r\n", route)?;
        }
        for record_route in &self.record_route {
            write!(out, "Record-Route: {}\r\n", record_route)?;
        }
        write!(out, "From: {}\r\n", self.from)?;
        write!(out, "To: {}\r\n", self.to)?;
        write!(out, "Call-ID: {}\r\n", self.call_id)?;
        write!(out, "CSeq: {}\r\n", self.cseq)?;
        for contact in &self.contact {
            write!(out, "Contact: {}\r\n", contact)?;
        }
        for (name, value) in self.other.iter() {
            if *name != HeaderName::ContentLength {
                write!(out, "{}: {}\r\n", name, value)?;
            }
        }
        write!(out, "Content-Length: {}\r\n\r\n", body.len())
    }
}

fn encode(start_line: fmt::Arguments<'_>, headers: &MessageHeaders, body: &Bytes) -> Bytes {
    let mut head = String::with_capacity(512);
    // Writing into a String cannot fail.
    let _ = head.write_fmt(start_line);
    let _ = headers.write_to(&mut head, body);
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: MessageHeaders,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: MessageHeaders) -> Self {
        Self {
            method,
            uri,
            headers,
            body: Bytes::new(),
        }
    }

    /// Sets the body together with its Content-Type
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.set_body(content_type, body);
        self
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers.set(HeaderName::ContentType, content_type);
    }

    pub fn call_id(&self) -> &str {
        &self.headers.call_id
    }

    pub fn cseq(&self) -> &CSeq {
        &self.headers.cseq
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.branch()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.from_tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag()
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Wire encoding with a computed Content-Length
    pub fn to_bytes(&self) -> Bytes {
        encode(
            format_args!("{} {} {}\r\n", self.method, self.uri, SIP_VERSION),
            &self.headers,
            &self.body,
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: MessageHeaders,
    pub body: Bytes,
}

impl Response {
    /// Creates a response with the default reason phrase
    pub fn new(status: StatusCode, headers: MessageHeaders) -> Self {
        Self {
            status,
            reason: status.reason_phrase().to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    /// Builds a response to `request` per RFC 3261 §8.2.6.
    ///
    /// Via, From, To, Call-ID and CSeq are copied. Record-Route is copied
    /// for 101-299 responses to dialog-creating requests (§12.1.1). The
    /// caller adds the To-tag and Contact where needed.
    pub fn for_request(status: StatusCode, request: &Request) -> Self {
        let src = &request.headers;
        let mut headers = MessageHeaders::new(src.from.clone(), src.to.clone(), src.call_id.clone(), src.cseq.clone());
        headers.via = src.via.clone();
        if status.as_u16() > 100 && status.as_u16() < 300 && request.method.creates_dialog() {
            headers.record_route = src.record_route.clone();
        }
        Response::new(status, headers)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.set_body(content_type, body);
        self
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers.set(HeaderName::ContentType, content_type);
    }

    pub fn call_id(&self) -> &str {
        &self.headers.call_id
    }

    pub fn cseq(&self) -> &CSeq {
        &self.headers.cseq
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.branch()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag()
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn to_bytes(&self) -> Bytes {
        encode(
            format_args!("{} {} {}\r\n", SIP_VERSION, self.status, self.reason),
            &self.headers,
            &self.body,
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Either kind of SIP message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &MessageHeaders {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Message::Request(r) => &r.body,
            Message::Response(r) => &r.body,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.headers().call_id
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => fmt::Display::fmt(r, f),
            Message::Response(r) => fmt::Display::fmt(r, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        let from = NameAddr::new("sip:alice@atlanta.com".parse().unwrap()).with_tag("1928301774");
        let to = NameAddr::new("sip:bob@biloxi.com".parse().unwrap());
        let mut headers = MessageHeaders::new(from, to, "a84b4c76e66710", CSeq::new(314159, Method::Invite));
        headers.via.push(Via::new("UDP", "pc33.atlanta.com", None, "z9hG4bKnashds8"));
        headers.record_route.push("<sip:p1.example.com;lr>".parse().unwrap());
        headers.set(HeaderName::MaxForwards, "70");
        Request::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap(), headers)
            .with_body("application/sdp", "v=0\r\n")
    }

    #[test]
    fn test_request_encoding_computes_content_length() {
        let text = String::from_utf8(invite().to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.ends_with("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_for_request_copies_record_route_for_dialog_responses() {
        let request = invite();
        let ringing = Response::for_request(StatusCode::RINGING, &request);
        assert_eq!(ringing.headers.record_route.len(), 1);

        let trying = Response::for_request(StatusCode::TRYING, &request);
        assert!(trying.headers.record_route.is_empty());

        let busy = Response::for_request(StatusCode::BUSY_HERE, &request);
        assert!(busy.headers.record_route.is_empty());
        assert_eq!(busy.reason, "Busy Here");
        assert!(busy.body.is_empty());
    }

    #[test]
    fn test_option_tags() {
        let mut request = invite();
        request.headers.append(HeaderName::Supported, "timer, 100rel");
        assert!(request.headers.has_option_tag(&HeaderName::Supported, "100REL"));
        assert!(!request.headers.has_option_tag(&HeaderName::Require, "100rel"));
    }
}
