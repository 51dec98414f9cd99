//! HTTP request encoder.
//!
//! Accepts a head followed by body pieces, the same `Message` sequence shape
//! the connection produces while it walks a request through its write states.

use std::io;
use std::io::ErrorKind;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::{HeaderEncoder, RequestHead};
use crate::protocol::{Message, PayloadSize, SendError};

/// Encoder for one request at a time: the head, then its payload until `Eof`.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a request body is still expected.
    pub fn is_body_pending(&self) -> bool {
        self.payload_encoder.is_some()
    }

    /// Forgets a partially written request; the connection is being torn down.
    pub fn reset(&mut self) {
        self.payload_encoder = None;
    }
}

impl<D: Buf> Encoder<Message<(RequestHead<'_>, PayloadSize), D>> for RequestEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(RequestHead<'_>, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive request head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                let payload_encoder = PayloadEncoder::from_payload_size(payload_size)?;
                self.header_encoder.encode((head, payload_size), dst)?;
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect request head but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);

                if result.is_err() || payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderList, PayloadItem};
    use bytes::Bytes;
    use http::Method;

    fn head<'a>(method: &'a Method, headers: &'a HeaderList) -> RequestHead<'a> {
        RequestHead { method, path: "/", headers, host: None, keep_alive: true, upgrade: None }
    }

    #[test]
    fn bodiless_request_needs_no_payload() {
        let headers = HeaderList::new();
        let mut encoder = RequestEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::<_, Bytes>::Header((head(&Method::GET, &headers), PayloadSize::Empty)), &mut dst).unwrap();
        assert!(!encoder.is_body_pending());
        assert!(dst.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn chunked_body() {
        let headers = HeaderList::new();
        let mut encoder = RequestEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::<_, Bytes>::Header((head(&Method::POST, &headers), PayloadSize::Chunked)), &mut dst).unwrap();
        assert!(encoder.is_body_pending());
        dst.clear();

        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"abc"))), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::<Bytes>::Eof), &mut dst).unwrap();
        assert_eq!(&dst[..], b"3\r\nabc\r\n0\r\n\r\n");
        assert!(!encoder.is_body_pending());
    }

    #[test]
    fn payload_without_head_is_rejected() {
        let mut encoder = RequestEncoder::new();
        let result = encoder.encode(
            Message::<(RequestHead<'_>, PayloadSize), Bytes>::Payload(PayloadItem::Chunk(Bytes::from_static(b"x"))),
            &mut BytesMut::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn length_mismatch_ends_the_body() {
        let headers = HeaderList::new();
        let mut encoder = RequestEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::<_, Bytes>::Header((head(&Method::PUT, &headers), PayloadSize::Length(4))), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"ab"))), &mut dst).unwrap();
        let err = encoder.encode(Message::Payload(PayloadItem::<Bytes>::Eof), &mut dst).unwrap_err();

        assert!(matches!(err, SendError::ContentLengthMismatch { expected: 4, actual: 2 }));
        assert!(!encoder.is_body_pending());
    }
}
