//! Error types for the unicast delivery library.

use std::fmt;

/// Errors that can occur in the unicast delivery library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/poll failures.
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP requests.
#[derive(Debug, thiserror::Error)]
pub enum UnicastError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a request message.
    #[error("request parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Specific kind of request parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
        }
    }
}

/// Convenience alias for `Result<T, UnicastError>`.
pub type Result<T> = std::result::Result<T, UnicastError>;
