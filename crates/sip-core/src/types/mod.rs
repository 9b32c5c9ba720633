//! Typed SIP message model.

pub mod address;
pub mod auth;
pub mod cseq;
pub mod header;
pub mod method;
pub mod param;
pub mod sip_message;
pub mod status;
pub mod uri;
pub mod via;

pub use address::NameAddr;
pub use auth::{DigestAuthorization, DigestChallenge};
pub use cseq::CSeq;
pub use header::{HeaderName, Headers};
pub use method::Method;
pub use param::{Param, Params};
pub use sip_message::{Message, MessageHeaders, Request, Response};
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
pub use via::Via;
