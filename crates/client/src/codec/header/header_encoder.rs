//! Request head encoder.
//!
//! Serializes the request line and header fields in caller order, then the
//! connection-managed fields: `Host` when the caller did not supply one,
//! `Connection` (and `Upgrade`), and exactly one of `Content-Length` or
//! `Transfer-Encoding: chunked` as the body framing requires.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::{header, HeaderValue, Method};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::FastWrite;
use crate::protocol::{HeaderList, PayloadSize, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 1024;

/// Borrowed view of everything the request line and header section need.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderList,
    /// Default `Host` value used when `headers` has none
    pub host: Option<&'a HeaderValue>,
    /// Ask the server to keep the connection open after this exchange
    pub keep_alive: bool,
    /// Protocol for `Upgrade`, if switching protocols is requested
    pub upgrade: Option<&'a str>,
}

/// Encoder for request heads implementing the [`Encoder`] trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderEncoder;

impl Encoder<(RequestHead<'_>, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    /// Encodes the request head into `dst`.
    ///
    /// # Errors
    ///
    /// Returns `SendError::InvalidBody` for `PayloadSize::UntilClose`, which a request can't use.
    fn encode(&mut self, item: (RequestHead<'_>, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, payload_size) = item;

        if payload_size.is_until_close() {
            error!(method = %head.method, "request body can't be delimited by connection close");
            return Err(SendError::invalid_body("request body can't be delimited by connection close"));
        }

        dst.reserve(INIT_HEADER_SIZE);
        write!(FastWrite(dst), "{} {} HTTP/1.1\r\n", head.method, head.path)?;

        if !head.headers.contains(header::HOST.as_str()) {
            if let Some(host) = head.host {
                put_field(dst, header::HOST.as_str(), host.as_bytes());
            }
        }

        for (name, value) in head.headers.iter() {
            // framing and connection fields are written below
            if *name == header::CONTENT_LENGTH || *name == header::CONNECTION {
                continue;
            }
            put_field(dst, name.as_str(), value.as_bytes());
        }

        match head.upgrade {
            Some(protocol) => {
                put_field(dst, header::CONNECTION.as_str(), b"upgrade");
                put_field(dst, header::UPGRADE.as_str(), protocol.as_bytes());
            }
            None if head.keep_alive => put_field(dst, header::CONNECTION.as_str(), b"keep-alive"),
            None => put_field(dst, header::CONNECTION.as_str(), b"close"),
        }

        match payload_size {
            PayloadSize::Length(n) => {
                dst.put_slice(b"content-length: ");
                write!(FastWrite(dst), "{n}\r\n")?;
            }
            PayloadSize::Chunked => put_field(dst, header::TRANSFER_ENCODING.as_str(), b"chunked"),
            PayloadSize::Empty | PayloadSize::UntilClose => {}
        }

        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn put_field(dst: &mut BytesMut, name: &str, value: &[u8]) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderName;
    use indoc::indoc;

    fn headers(fields: &[(&'static str, &'static str)]) -> HeaderList {
        fields.iter().map(|(n, v)| (HeaderName::from_static(n), HeaderValue::from_static(v))).collect()
    }

    fn encode(head: RequestHead<'_>, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn simple_get() {
        let list = headers(&[("accept", "*/*")]);
        let host = HeaderValue::from_static("example.com");
        let head = RequestHead { method: &Method::GET, path: "/index.html", headers: &list, host: Some(&host), keep_alive: true, upgrade: None };

        let expected = indoc! {"
            GET /index.html HTTP/1.1\r
            host: example.com\r
            accept: */*\r
            connection: keep-alive\r
            \r
        "};
        assert_eq!(encode(head, PayloadSize::Empty), expected);
    }

    #[test]
    fn caller_host_wins_and_length_is_rewritten() {
        let list = headers(&[("host", "a.test"), ("content-length", "5"), ("x-b", "1"), ("x-a", "2")]);
        let host = HeaderValue::from_static("b.test");
        let head = RequestHead { method: &Method::POST, path: "/", headers: &list, host: Some(&host), keep_alive: false, upgrade: None };

        let expected = indoc! {"
            POST / HTTP/1.1\r
            host: a.test\r
            x-b: 1\r
            x-a: 2\r
            connection: close\r
            content-length: 5\r
            \r
        "};
        assert_eq!(encode(head, PayloadSize::Length(5)), expected);
    }

    #[test]
    fn chunked_never_with_length() {
        let list = HeaderList::new();
        let head = RequestHead { method: &Method::PUT, path: "/upload", headers: &list, host: None, keep_alive: true, upgrade: None };

        let encoded = encode(head, PayloadSize::Chunked);
        assert!(encoded.contains("transfer-encoding: chunked\r\n"));
        assert!(!encoded.contains("content-length"));
    }

    #[test]
    fn upgrade_request() {
        let list = HeaderList::new();
        let head = RequestHead { method: &Method::GET, path: "/chat", headers: &list, host: None, keep_alive: true, upgrade: Some("websocket") };

        let encoded = encode(head, PayloadSize::Empty);
        assert!(encoded.contains("connection: upgrade\r\nupgrade: websocket\r\n"));
    }

    #[test]
    fn until_close_is_rejected() {
        let list = HeaderList::new();
        let head = RequestHead { method: &Method::POST, path: "/", headers: &list, host: None, keep_alive: true, upgrade: None };
        assert!(HeaderEncoder.encode((head, PayloadSize::UntilClose), &mut BytesMut::new()).is_err());
    }
}
