//! # Digest authentication headers
//!
//! Challenge (`WWW-Authenticate` / `Proxy-Authenticate`) and credentials
//! (`Authorization` / `Proxy-Authorization`) values for HTTP Digest as used by
//! SIP ([RFC 3261 §22.4](https://datatracker.ietf.org/doc/html/rfc3261#section-22.4),
//! [RFC 2617](https://datatracker.ietf.org/doc/html/rfc2617)). Computing the
//! response hash is left to the user agent layer.
//!
//! ```rust
//! use sipflow_sip_core::prelude::*;
//!
//! let challenge: DigestChallenge =
//!     r#"Digest realm="atlanta.com", nonce="84a4cc6f", qop="auth,auth-int", stale=FALSE"#
//!         .parse()
//!         .unwrap();
//! assert_eq!(challenge.realm, "atlanta.com");
//! assert!(challenge.supports_qop_auth());
//! assert!(!challenge.stale);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::header::split_header_list;

/// A Digest challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `MD5` when absent
    pub algorithm: Option<String>,
    /// Offered quality-of-protection values
    pub qop: Vec<String>,
    pub stale: bool,
    pub domain: Option<String>,
}

impl DigestChallenge {
    pub fn supports_qop_auth(&self) -> bool {
        self.qop.iter().any(|q| q.eq_ignore_ascii_case("auth"))
    }

    /// Whether the algorithm is one this stack can answer (MD5)
    pub fn is_md5(&self) -> bool {
        self.algorithm.as_deref().is_none_or(|a| a.eq_ignore_ascii_case("MD5"))
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

/// Splits `Digest a=b, c="d"` into its scheme and parameter pairs
fn parse_auth_params(header: &'static str, s: &str) -> Result<(String, Vec<(String, String)>)> {
    let s = s.trim();
    let (scheme, rest) = s
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::header(header, "missing auth parameters"))?;
    let mut params = Vec::new();
    for item in split_header_list(rest) {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| Error::header(header, format!("malformed auth parameter '{}'", item)))?;
        params.push((name.trim().to_ascii_lowercase(), unquote(value)));
    }
    Ok((scheme.to_string(), params))
}

impl FromStr for DigestChallenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params("WWW-Authenticate", s)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(Error::header("WWW-Authenticate", format!("unsupported scheme {}", scheme)));
        }

        let mut realm = None;
        let mut nonce = None;
        let mut challenge = DigestChallenge {
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: None,
            qop: Vec::new(),
            stale: false,
            domain: None,
        };
        for (name, value) in params {
            match name.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => challenge.opaque = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                "qop" => {
                    challenge.qop = value.split(',').map(|q| q.trim().to_string()).collect();
                }
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                "domain" => challenge.domain = Some(value),
                _ => {}
            }
        }
        challenge.realm = realm.ok_or_else(|| Error::header("WWW-Authenticate", "missing realm"))?;
        challenge.nonce = nonce.ok_or_else(|| Error::header("WWW-Authenticate", "missing nonce"))?;
        Ok(challenge)
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)?;
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={}", algorithm)?;
        }
        if !self.qop.is_empty() {
            write!(f, ", qop=\"{}\"", self.qop.join(","))?;
        }
        if self.stale {
            f.write_str(", stale=TRUE")?;
        }
        Ok(())
    }
}

/// Digest credentials sent in `Authorization` or `Proxy-Authorization`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestAuthorization {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    /// digest-uri, the Request-URI of the challenged request
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    /// Nonce count, eight hex digits
    pub nc: Option<String>,
}

impl fmt::Display for DigestAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={}", algorithm)?;
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{}\"", cnonce)?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop={}", qop)?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={}", nc)?;
        }
        Ok(())
    }
}

impl FromStr for DigestAuthorization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params("Authorization", s)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(Error::header("Authorization", format!("unsupported scheme {}", scheme)));
        }
        let find = |key: &str| params.iter().find(|(n, _)| n == key).map(|(_, v)| v.clone());
        let required = |key: &'static str| {
            find(key).ok_or_else(|| Error::header("Authorization", format!("missing {}", key)))
        };
        Ok(DigestAuthorization {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: find("algorithm"),
            opaque: find("opaque"),
            qop: find("qop"),
            cnonce: find("cnonce"),
            nc: find("nc"),
        })
    }
}
