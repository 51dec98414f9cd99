//! Response body decoding.
//!
//! [`PayloadDecoder`] picks the strategy matching the framing resolved from the
//! response head: fixed length, chunked, read until the peer closes, or no body.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{HeaderList, ParseError, PayloadItem, PayloadSize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    /// Everything until end of stream belongs to the body
    UntilClose,
    NoBody,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// `max_trailer_size` bounds the trailer section after the last chunk.
    pub fn chunked(max_trailer_size: usize) -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new(max_trailer_size)) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    pub fn until_close() -> Self {
        Self { kind: Kind::UntilClose }
    }

    pub fn from_payload_size(payload_size: PayloadSize, max_trailer_size: usize) -> Self {
        match payload_size {
            PayloadSize::Length(0) | PayloadSize::Empty => Self::empty(),
            PayloadSize::Length(size) => Self::fix_length(size),
            PayloadSize::Chunked => Self::chunked(max_trailer_size),
            PayloadSize::UntilClose => Self::until_close(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    pub fn is_until_close(&self) -> bool {
        matches!(self.kind, Kind::UntilClose)
    }

    /// Trailer fields of a finished chunked body; empty for every other kind.
    pub fn take_trailers(&mut self) -> HeaderList {
        match &mut self.kind {
            Kind::Chunked(decoder) => decoder.take_trailers(),
            _ => HeaderList::new(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::UntilClose if src.is_empty() => Ok(None),
            Kind::UntilClose => Ok(Some(PayloadItem::Chunk(src.split().freeze()))),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    /// Called once the peer closed: only a read-until-close body may end here.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if self.is_until_close() => Ok(Some(PayloadItem::Eof)),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_close_ends_at_eof() {
        let mut decoder = PayloadDecoder::until_close();
        let mut buffer = BytesMut::from(&b"some"[..]);

        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), "some");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b" more");
        assert_eq!(decoder.decode_eof(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), " more");
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn framed_body_cut_by_eof() {
        let mut decoder = PayloadDecoder::fix_length(10);
        let mut buffer = BytesMut::from(&b"12345"[..]);

        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(ParseError::UnexpectedEof)));

        let mut decoder = PayloadDecoder::chunked(1024);
        let mut buffer = BytesMut::from(&b"5\r\nab"[..]);
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(ParseError::UnexpectedEof)));
    }

    #[test]
    fn zero_length_is_empty() {
        let mut decoder = PayloadDecoder::from_payload_size(PayloadSize::Length(0), 1024);
        assert!(decoder.is_empty());
        assert!(decoder.decode(&mut BytesMut::new()).unwrap().unwrap().is_eof());
    }
}
