//! Response head decoder.
//!
//! Parses the status line and header section with `httparse`, then derives the
//! connection-management flags the connection needs (keep-alive, the server's
//! keep-alive timeout, body framing). Framing that depends on the request
//! (HEAD, CONNECT, upgrades) is settled by [`resolve_framing`].
//!
//! The header size limit applies to the whole head, however many reads it takes
//! to arrive: while the head is incomplete the buffered byte count is checked
//! against the limit on every call.

use bytes::BytesMut;
use http::{header, HeaderName, HeaderValue, Method, StatusCode, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::response::parse_keep_alive_timeout;
use crate::protocol::{HeadFlags, HeaderList, ParseError, PayloadSize, ResponseHead};

/// Maximum number of header fields in a response head
pub const MAX_HEADER_NUM: usize = 128;

/// Default limit for the size of a response head in bytes
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

/// Decoder for response heads implementing the [`Decoder`] trait.
#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder {
    max_header_size: usize,
}

impl HeaderDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size }
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl Decoder for HeaderDecoder {
    type Item = ResponseHead;
    type Error = ParseError;

    /// Attempts to decode a response head from the front of `src`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(head))` once the head is complete; it is split off `src`
    /// - `Ok(None)` if more data is needed
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - The head exceeds the size limit, complete or not
    /// - The number of headers exceeds `MAX_HEADER_NUM`
    /// - The version is not HTTP/1.0 or HTTP/1.1
    /// - The status line or a header field is malformed
    /// - `Content-Length` is invalid or conflicts with `Transfer-Encoding`
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut res = httparse::Response::new(&mut headers);

        let parsed = res.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            Error::Version => ParseError::InvalidVersion(None),
            Error::Status => ParseError::InvalidStatus(None),
            e => ParseError::invalid_header(e),
        })?;

        let head_size = match parsed {
            Status::Complete(head_size) => head_size,
            Status::Partial => {
                ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
                return Ok(None);
            }
        };

        trace!(head_size, "parsed response head");
        ensure!(head_size <= self.max_header_size, ParseError::too_large_header(head_size, self.max_header_size));

        let version = match res.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let code = res.code.ok_or(ParseError::InvalidStatus(None))?;
        let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus(Some(code)))?;

        let mut header_list = HeaderList::with_capacity(res.headers.len());
        for field in res.headers.iter() {
            let name = HeaderName::from_bytes(field.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(field.value).map_err(ParseError::invalid_header)?;
            header_list.append(name, value);
        }

        let flags = parse_flags(version, &header_list)?;
        let _ = src.split_to(head_size);

        Ok(Some(ResponseHead::new(version, status, header_list, flags)))
    }
}

/// Derives keep-alive facts and header-only framing.
///
/// `payload` is the framing the headers alone imply; [`resolve_framing`] refines it.
fn parse_flags(version: Version, headers: &HeaderList) -> Result<HeadFlags, ParseError> {
    let connection_close = headers.has_token(header::CONNECTION.as_str(), "close");
    let connection_keep_alive = headers.has_token(header::CONNECTION.as_str(), "keep-alive");
    let keep_alive_header = headers.get("keep-alive");

    let keep_alive = match version {
        Version::HTTP_11 => !connection_close,
        _ => connection_keep_alive && !connection_close,
    };

    Ok(HeadFlags {
        keep_alive,
        explicit_keep_alive: connection_keep_alive || keep_alive_header.is_some(),
        keep_alive_timeout: keep_alive_header.and_then(|value| parse_keep_alive_timeout(value.as_bytes())),
        upgrade: false,
        payload: Some(parse_payload(headers)?),
    })
}

/// Body framing from `Transfer-Encoding` and `Content-Length`,
/// following [RFC 9112 Section 6.3](https://www.rfc-editor.org/rfc/rfc9112#section-6.3).
fn parse_payload(headers: &HeaderList) -> Result<PayloadSize, ParseError> {
    let te_present = headers.contains(header::TRANSFER_ENCODING.as_str());
    let mut cl_values = headers.get_all(header::CONTENT_LENGTH.as_str()).peekable();

    match (te_present, cl_values.peek().is_some()) {
        (false, false) => Ok(PayloadSize::UntilClose),

        (true, false) => {
            if is_chunked(headers) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::UntilClose)
            }
        }

        (false, true) => {
            let mut length = None;
            for value in cl_values {
                // a list form such as "42, 42" is allowed when every member agrees
                for member in value.as_bytes().split(|b| *b == b',') {
                    let parsed = parse_length(member)?;
                    match length {
                        Some(previous) if previous != parsed => {
                            return Err(ParseError::invalid_content_length(format!("conflicting values {previous} and {parsed}")));
                        }
                        _ => length = Some(parsed),
                    }
                }
            }
            length.map(PayloadSize::Length).ok_or_else(|| ParseError::invalid_content_length("empty value"))
        }

        (true, true) => Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers")),
    }
}

fn parse_length(value: &[u8]) -> Result<u64, ParseError> {
    let value = value.trim_ascii();
    ensure!(
        !value.is_empty() && value.iter().all(u8::is_ascii_digit),
        ParseError::invalid_content_length(format!("value {:?} is not u64", String::from_utf8_lossy(value)))
    );
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ParseError::invalid_content_length("value overflows u64"))
}

/// Checks that `chunked` is the final coding of the last `Transfer-Encoding` field.
fn is_chunked(headers: &HeaderList) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING.as_str())
        .last()
        .and_then(|value| value.as_bytes().rsplit(|b| *b == b',').next())
        .is_some_and(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

/// Settles the framing of `head` against the request it answers.
///
/// - `HEAD`, 1xx, `204` and `304` carry no body
/// - `101` switches protocols, which is only valid if `upgrade_requested`
/// - a 2xx to `CONNECT` turns the connection into a tunnel
///
/// # Errors
///
/// Returns `ParseError::UnexpectedUpgrade` for a `101` the request did not ask for.
pub fn resolve_framing(head: &mut ResponseHead, method: &Method, upgrade_requested: bool) -> Result<(), ParseError> {
    let status = head.status();
    let mut flags = *head.flags();

    if status == StatusCode::SWITCHING_PROTOCOLS {
        ensure!(upgrade_requested, ParseError::UnexpectedUpgrade);
        flags.upgrade = true;
        flags.keep_alive = false;
        flags.payload = Some(PayloadSize::Empty);
    } else if *method == Method::CONNECT && status.is_success() {
        flags.upgrade = true;
        flags.keep_alive = false;
        flags.payload = Some(PayloadSize::Empty);
    } else if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        flags.payload = Some(PayloadSize::Empty);
    }

    if flags.payload == Some(PayloadSize::UntilClose) {
        flags.keep_alive = false;
    }

    head.set_flags(flags);
    Ok(())
}
