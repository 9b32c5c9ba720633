//! # SIP URIs
//!
//! [`Uri`] models the SIP and SIPS URIs of RFC 3261 §19.1. Other schemes
//! (`tel:`, `http:` ...) are kept with their opaque remainder so the user
//! agent core can answer them with 416 instead of failing to parse the
//! whole message.
//!
//! ```rust
//! use sipflow_sip_core::prelude::*;
//!
//! let uri: Uri = "sip:alice@atlanta.example.com:5060;transport=udp".parse().unwrap();
//! assert_eq!(uri.scheme, Scheme::Sip);
//! assert_eq!(uri.user.as_deref(), Some("alice"));
//! assert_eq!(uri.port, Some(5060));
//! assert_eq!(uri.params.value("transport"), Some("udp"));
//!
//! let proxy: Uri = "sip:proxy.example.com;lr".parse().unwrap();
//! assert!(proxy.is_loose_router());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::param::Params;

/// URI scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    /// Any other scheme, lowercased
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Other(s) => s,
        }
    }

    pub(crate) fn from_token(token: &str) -> Scheme {
        match token.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            other => Scheme::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP, SIPS or opaque URI.
///
/// For non-SIP schemes `host` holds everything after the colon and the
/// remaining fields are empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    /// `?name=value&...` headers; never allowed in a Request-URI
    pub headers: Vec<(String, String)>,
}

impl Uri {
    /// Creates a `sip:` URI for the given host
    pub fn sip(host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: Params::default(),
            headers: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Adds a URI parameter; `None` makes it a flag
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.set(name, value);
        self
    }

    /// `sip` or `sips`
    pub fn is_sip(&self) -> bool {
        matches!(self.scheme, Scheme::Sip | Scheme::Sips)
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Whether this URI, used as a route entry, designates a loose router (`;lr`)
    pub fn is_loose_router(&self) -> bool {
        self.params.contains("lr")
    }

    /// `host[:port]`
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Copy of this URI with the components RFC 3261 §19.1.1 forbids in a
    /// Request-URI removed (the `method` parameter and URI headers).
    pub fn to_request_uri(&self) -> Uri {
        let mut uri = self.clone();
        uri.params.remove("method");
        uri.headers.clear();
        uri
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.is_sip() {
            return f.write_str(&self.host);
        }
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::uri::parse_uri(s.trim(), true)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let text = "sips:bob:secret@[2001:db8::1]:5061;transport=tls;lr?subject=hi&priority=urgent";
        let uri: Uri = text.parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.headers.len(), 2);
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn test_request_uri_strips_method_and_headers() {
        let uri: Uri = "sip:proxy.example.com;method=INVITE;lr?x=y".parse().unwrap();
        assert_eq!(uri.to_request_uri().to_string(), "sip:proxy.example.com;lr");
    }

    #[test]
    fn test_opaque_scheme_is_preserved() {
        let uri: Uri = "tel:+1-201-555-0123".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Tel);
        assert!(!uri.is_sip());

        let uri: Uri = "http://example.com/x".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Other("http".into()));
        assert_eq!(uri.to_string(), "http://example.com/x");
    }

    #[test]
    fn test_serde_as_string() {
        let uri = Uri::sip("example.com").with_user("alice");
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"sip:alice@example.com\"");
        let back: Uri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }
}
