//! Core SIP message model for sipflow
//!
//! This crate provides the SIP message types, the wire parser and the
//! serializer used by the transaction and dialog layers.

pub mod error;
pub mod parser;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use parser::parse_message;
pub use types::{
    CSeq, DigestAuthorization, DigestChallenge, HeaderName, Headers, Message, MessageHeaders, Method,
    NameAddr, Param, Params, Request, Response, Scheme, StatusCode, Uri, Via,
};

/// Re-export of common types and functions
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::parser::message::{MAX_BODY_SIZE, MAX_HEADER_COUNT, MAX_LINE_LENGTH};
    pub use crate::parser::parse_message;
    pub use crate::types::header::split_header_list;
    pub use crate::types::*;
    pub use crate::utils::{generate_branch, generate_call_id, generate_tag};
}
