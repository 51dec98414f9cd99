use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};

/// Frames a request body the way its head announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEncoder {
    /// `Content-Length` body, the announced length is enforced
    Length(LengthEncoder),
    /// `Transfer-Encoding: chunked` body
    Chunked(ChunkedEncoder),
    /// Request without a body
    Empty,
}

impl PayloadEncoder {
    /// Request bodies are never close-delimited, `UntilClose` is rejected.
    pub fn from_payload_size(payload_size: PayloadSize) -> Result<Self, SendError> {
        let encoder = match payload_size {
            PayloadSize::Length(size) => Self::Length(LengthEncoder::new(size)),
            PayloadSize::Chunked => Self::Chunked(ChunkedEncoder::new()),
            PayloadSize::Empty => Self::Empty,
            PayloadSize::UntilClose => {
                return Err(SendError::invalid_body("request body can't be delimited by connection close"));
            }
        };
        Ok(encoder)
    }

    /// True once the terminating item went out, or right away for an empty body.
    pub fn is_finish(&self) -> bool {
        match self {
            Self::Length(length) => length.is_finish(),
            Self::Chunked(chunked) => chunked.is_finish(),
            Self::Empty => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            Self::Length(length) => length.encode(item, dst),
            Self::Chunked(chunked) => chunked.encode(item, dst),
            Self::Empty => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn empty_body_is_finished_up_front() {
        let encoder = PayloadEncoder::from_payload_size(PayloadSize::Empty).unwrap();
        assert!(encoder.is_finish());
    }

    #[test]
    fn close_delimited_request_is_rejected() {
        assert!(PayloadEncoder::from_payload_size(PayloadSize::UntilClose).is_err());
    }

    #[test]
    fn chunked_body_finishes_on_eof() {
        let mut encoder = PayloadEncoder::from_payload_size(PayloadSize::Chunked).unwrap();
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hi")), &mut dst).unwrap();
        assert!(!encoder.is_finish());
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"2\r\nhi\r\n0\r\n\r\n");
    }
}
