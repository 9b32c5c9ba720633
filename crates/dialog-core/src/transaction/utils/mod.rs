//! Message construction helpers shared by the transaction and user agent layers
//!
//! - `request_builders` - ACK, CANCEL and new out-of-dialog requests
//! - `response_builders` - responses with To-tags and stateless replies

pub mod request_builders;
pub mod response_builders;

pub use request_builders::{create_ack_from_invite, create_cancel, create_request, RequestTemplate};
pub use response_builders::{create_response, create_stateless_response};
