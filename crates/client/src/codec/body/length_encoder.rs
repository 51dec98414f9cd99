use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::protocol::{PayloadItem, SendError};

/// Writes a body announced with `Content-Length`, refusing to send more or less.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    expected: u64,
    sent: u64,
    eof: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { expected: length, sent: 0, eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            warn!("encode payload_item but no need to encode anymore");
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(mut bytes) => {
                let size = bytes.remaining() as u64;
                if self.sent + size > self.expected {
                    return Err(SendError::content_length_mismatch(self.expected, self.sent + size));
                }
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
                self.sent += size;
                Ok(())
            }
            PayloadItem::Eof => {
                if self.sent != self.expected {
                    return Err(SendError::content_length_mismatch(self.expected, self.sent));
                }
                self.eof = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn exact_length() {
        let mut encoder = LengthEncoder::new(5);
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hel")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"lo")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        assert_eq!(&dst[..], b"hello");
        assert!(encoder.is_finish());
    }

    #[test]
    fn mismatch_is_reported() {
        let mut encoder = LengthEncoder::new(2);
        let err = encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"abc")), &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, SendError::ContentLengthMismatch { expected: 2, actual: 3 }));

        let mut encoder = LengthEncoder::new(4);
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"ab")), &mut BytesMut::new()).unwrap();
        let err = encoder.encode(PayloadItem::<Bytes>::Eof, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, SendError::ContentLengthMismatch { expected: 4, actual: 2 }));
    }
}
