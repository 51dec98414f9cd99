use bytes::{Buf, Bytes};

use crate::protocol::{HeaderList, ResponseHead};

/// One item written to the request encoder: the head first, then body items.
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

/// A piece of body, or the marker ending it.
///
/// Body decoders yield these for responses and body encoders consume them for
/// requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

/// How a message body is delimited on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length` bytes follow the head
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// No body at all
    Empty,
    /// Runs until the peer closes the connection; only valid for responses
    UntilClose,
}

impl PayloadSize {
    #[inline]
    pub fn is_until_close(&self) -> bool {
        matches!(self, PayloadSize::UntilClose)
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    /// The chunk's bytes, `None` for `Eof`.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        if let PayloadItem::Chunk(bytes) = self { Some(bytes) } else { None }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        if let PayloadItem::Chunk(bytes) = self { Some(bytes) } else { None }
    }
}

/// A structured event produced by the response parser.
///
/// Events own their data: body chunks are `Bytes` split off the parser buffer,
/// so they stay valid after the `feed` call that produced them returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// The first byte of a new response was seen
    MessageBegin,
    /// The status line and header section are complete
    Headers(ResponseHead),
    /// A piece of the response body
    Data(Bytes),
    /// Trailer fields of a chunked body
    Trailers(HeaderList),
    /// The response is complete
    MessageComplete,
    /// The connection switched protocols; carries the bytes after the response head
    Upgrade(Bytes),
}

impl ParserEvent {
    /// Number of body bytes carried by a `Data` event, zero for every other event.
    #[inline]
    pub fn data_len(&self) -> usize {
        match self {
            ParserEvent::Data(bytes) => bytes.len(),
            _ => 0,
        }
    }
}
