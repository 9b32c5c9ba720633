//! Wire format parser.
//!
//! Built on `nom` combinators for the start lines, URIs and structured
//! header values; framing (header unfolding, Content-Length) is handled in
//! [`message`].

pub mod headers;
pub mod message;
pub mod uri;

use nom::IResult;

pub use message::parse_message;

/// Result type of the internal combinators
pub type ParseResult<'a, O> = IResult<&'a str, O>;

/// RFC 3261 `token` character
pub fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}
