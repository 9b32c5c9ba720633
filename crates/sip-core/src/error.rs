use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or building SIP messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid SIP method token
    #[error("Invalid SIP method: {0}")]
    InvalidMethod(String),

    /// Invalid SIP or SIPS URI
    #[error("Invalid SIP URI: {0}")]
    InvalidUri(String),

    /// Invalid SIP version in a start line
    #[error("Invalid SIP version: {0}")]
    InvalidVersion(String),

    /// Status code outside of 100..=699
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Request-Line or Status-Line could not be parsed
    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    /// A header value could not be parsed
    #[error("Invalid {header} header: {reason}")]
    InvalidHeader {
        /// Header name as it appeared on the wire
        header: String,
        /// What was wrong with it
        reason: String,
    },

    /// One of Call-ID, From, To, CSeq or Via is missing
    #[error("Missing mandatory header: {0}")]
    MissingHeader(&'static str),

    /// The body is shorter than the Content-Length announced
    #[error("Message body truncated: expected {expected} bytes, got {actual}")]
    BodyTruncated {
        /// Content-Length value
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Any other framing problem
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

impl Error {
    pub(crate) fn header(header: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            header: header.into(),
            reason: reason.into(),
        }
    }
}
