use std::io;
use std::time::Duration;

use thiserror::Error;

/// The error delivered to a [`Handler`](crate::handler::Handler) through `on_error`.
///
/// Every dispatched request observes exactly one terminal callback; when that
/// callback is `on_error` it carries one of these variants. The type is `Clone`
/// because a single connection-fatal cause fans out to every pending request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("parse error: {reason}")]
    Parse { reason: String },

    #[error("socket error: {reason}")]
    Socket { kind: io::ErrorKind, reason: String },

    #[error("request aborted{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted { reason: Option<String> },

    #[error("request aborted because another request on the same connection was aborted")]
    ConnectionAborted,

    #[error("other side closed the connection in the middle of a message")]
    UnexpectedEof,

    #[error("response body exceeds the limit {max_size}")]
    ResponseTooLarge { max_size: usize },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("headers timeout after {0:?}")]
    HeadersTimeout(Duration),

    #[error("body timeout after {0:?}")]
    BodyTimeout(Duration),

    #[error("connection closed before the request completed")]
    Closed,

    #[error("request body length mismatch, expected {expected} but got {actual}")]
    RequestContentLengthMismatch { expected: u64, actual: u64 },

    #[error("request body error: {reason}")]
    RequestBody { reason: String },

    #[error("response status {status} is retryable")]
    ResponseStatus { status: u16, retry_after: Option<Duration> },

    #[error("resumed response does not match the original: {reason}")]
    RetryMismatch { reason: String },
}

impl ClientError {
    pub fn parse<S: ToString>(reason: S) -> Self {
        Self::Parse { reason: reason.to_string() }
    }

    pub fn socket(e: &io::Error) -> Self {
        Self::Socket { kind: e.kind(), reason: e.to_string() }
    }

    pub fn aborted() -> Self {
        Self::Aborted { reason: None }
    }

    pub fn aborted_with<S: ToString>(reason: S) -> Self {
        Self::Aborted { reason: Some(reason.to_string()) }
    }

    pub fn invalid_argument<S: ToString>(reason: S) -> Self {
        Self::InvalidArgument { reason: reason.to_string() }
    }

    pub fn request_body<S: ToString>(reason: S) -> Self {
        Self::RequestBody { reason: reason.to_string() }
    }

    pub fn retry_mismatch<S: ToString>(reason: S) -> Self {
        Self::RetryMismatch { reason: reason.to_string() }
    }

    /// Returns true if the error was initiated by the caller.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            _ => Self::socket(&e),
        }
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::UnexpectedEof => Self::UnexpectedEof,
            ParseError::Io { source } => Self::socket(&source),
            e => Self::parse(e),
        }
    }
}

impl From<SendError> for ClientError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::ContentLengthMismatch { expected, actual } => Self::RequestContentLengthMismatch { expected, actual },
            SendError::InvalidBody { reason } => Self::RequestBody { reason },
            SendError::Io { source } => Self::socket(&source),
        }
    }
}

/// Errors raised while decoding a response from the wire.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid status code: {0:?}")]
    InvalidStatus(Option<u16>),

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("received a response while no request is waiting for one")]
    UnexpectedResponse,

    #[error("received an upgrade response for a request that did not ask for one")]
    UnexpectedUpgrade,

    #[error("unexpected end of stream in the middle of a message")]
    UnexpectedEof,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Copies the error, rebuilding an `Io` source from its kind and message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::TooLargeHeader { current_size, max_size } => Self::too_large_header(*current_size, *max_size),
            Self::TooManyHeaders { max_num } => Self::too_many_headers(*max_num),
            Self::InvalidHeader { reason } => Self::invalid_header(reason),
            Self::InvalidVersion(v) => Self::InvalidVersion(*v),
            Self::InvalidStatus(s) => Self::InvalidStatus(*s),
            Self::InvalidContentLength { reason } => Self::invalid_content_length(reason),
            Self::InvalidBody { reason } => Self::invalid_body(reason),
            Self::UnexpectedResponse => Self::UnexpectedResponse,
            Self::UnexpectedUpgrade => Self::UnexpectedUpgrade,
            Self::UnexpectedEof => Self::UnexpectedEof,
            Self::Io { source } => Self::io(io::Error::new(source.kind(), source.to_string())),
        }
    }
}

/// Errors raised while encoding a request onto the wire.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("request body length mismatch, expected {expected} but got {actual}")]
    ContentLengthMismatch { expected: u64, actual: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn content_length_mismatch(expected: u64, actual: u64) -> Self {
        Self::ContentLengthMismatch { expected, actual }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_eof_maps_to_unexpected_eof() {
        assert_eq!(ClientError::from(ParseError::UnexpectedEof), ClientError::UnexpectedEof);
        assert!(matches!(ClientError::from(ParseError::InvalidStatus(Some(42))), ClientError::Parse { .. }));
    }

    #[test]
    fn send_error_mapping() {
        assert_eq!(
            ClientError::from(SendError::content_length_mismatch(10, 4)),
            ClientError::RequestContentLengthMismatch { expected: 10, actual: 4 }
        );

        let err = ClientError::from(SendError::io(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(matches!(err, ClientError::Socket { kind: io::ErrorKind::BrokenPipe, .. }));
    }

    #[test]
    fn aborted_display() {
        assert_eq!(ClientError::aborted().to_string(), "request aborted");
        assert_eq!(ClientError::aborted_with("user gone").to_string(), "request aborted: user gone");
    }
}
