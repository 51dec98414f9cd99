//! Decoder for chunked response bodies.
//!
//! Implements the chunked coding of
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//! Chunk extensions are skipped. Trailer fields after the last chunk are parsed
//! with `httparse::parse_headers` and kept until [`ChunkedDecoder::take_trailers`].

use std::io;
use std::io::ErrorKind;
use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{HeaderList, ParseError, PayloadItem};
use ChunkedState::*;

/// Maximum number of trailer fields accepted after the last chunk
const MAX_TRAILER_NUM: usize = 32;

/// A decoder for chunked transfer coding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    max_trailer_size: usize,
    trailers: Option<HeaderList>,
}

impl ChunkedDecoder {
    pub fn new(max_trailer_size: usize) -> Self {
        Self { state: Size, remaining_size: 0, max_trailer_size, trailers: None }
    }

    /// Takes the trailer fields received after the last chunk.
    pub fn take_trailers(&mut self) -> HeaderList {
        self.trailers.take().unwrap_or_default()
    }

    /// Returns true once the terminating chunk and trailer section were consumed.
    pub fn is_finished(&self) -> bool {
        self.state == End
    }

    /// Parses the trailer section, which starts right after the last-chunk line.
    ///
    /// Returns `Ok(false)` while the section is incomplete.
    fn read_trailers(&mut self, src: &mut BytesMut) -> Result<bool, ParseError> {
        if src.len() < 2 {
            return Ok(false);
        }

        if src.starts_with(b"\r\n") {
            src.advance(2);
            return Ok(true);
        }

        let mut fields = [httparse::EMPTY_HEADER; MAX_TRAILER_NUM];
        match httparse::parse_headers(src, &mut fields) {
            Ok(httparse::Status::Complete((offset, parsed))) => {
                let mut trailers = HeaderList::with_capacity(parsed.len());
                for field in parsed {
                    let name = HeaderName::from_bytes(field.name.as_bytes()).map_err(ParseError::invalid_header)?;
                    let value = HeaderValue::from_bytes(field.value).map_err(ParseError::invalid_header)?;
                    trailers.append(name, value);
                }
                trace!(count = trailers.len(), "parsed chunked trailers");
                self.trailers = Some(trailers);
                src.advance(offset);
                Ok(true)
            }
            Ok(httparse::Status::Partial) => {
                ensure!(src.len() <= self.max_trailer_size, ParseError::too_large_header(src.len(), self.max_trailer_size));
                Ok(false)
            }
            Err(httparse::Error::TooManyHeaders) => Err(ParseError::too_many_headers(MAX_TRAILER_NUM)),
            Err(e) => Err(ParseError::invalid_header(e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailers,
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes as much of the chunked body as `src` allows.
    ///
    /// Returns a `Chunk` for every piece of chunk data, `Eof` once the trailer
    /// section is complete, or `None` when more bytes are needed.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                End => {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }
                Trailers => {
                    if !self.read_trailers(src)? {
                        return Ok(None);
                    }
                    self.state = End;
                    continue;
                }
                _ => {}
            }

            if src.is_empty() {
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.state.step(src, &mut self.remaining_size, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(ParseError::invalid_body(e)),
            };

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.is_empty() {
            return Poll::Pending;
        }
        $src.get_u8()
    }};
}

fn invalid(msg: &'static str) -> Poll<Result<ChunkedState, io::Error>> {
    Poll::Ready(Err(io::Error::new(ErrorKind::InvalidData, msg)))
}

impl ChunkedState {
    fn step(&self, src: &mut BytesMut, remaining_size: &mut u64, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, io::Error>> {
        match self {
            Size => ChunkedState::read_size(src, remaining_size),
            SizeLws => ChunkedState::read_size_lws(src),
            Extension => ChunkedState::read_extension(src),
            SizeLf => ChunkedState::read_size_lf(src, *remaining_size),
            Body => ChunkedState::read_body(src, remaining_size, buf),
            BodyCr => ChunkedState::read_body_cr(src),
            BodyLf => ChunkedState::read_body_lf(src),
            Trailers => Poll::Ready(Ok(Trailers)),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Accumulates the hexadecimal chunk size one digit at a time.
    fn read_size(src: &mut BytesMut, size: &mut u64) -> Poll<Result<ChunkedState, io::Error>> {
        let digit = match try_next_byte!(src) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            _ => return invalid("invalid chunk size line: Invalid Size"),
        };

        match size.checked_mul(16).and_then(|s| s.checked_add(u64::from(digit))) {
            Some(s) => *size = s,
            None => return invalid("invalid overflow chunked length"),
        }

        Poll::Ready(Ok(Size))
    }

    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            // no more digits after whitespace
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => invalid("invalid chunk size linear white space"),
        }
    }

    /// Skips a chunk extension up to its CR; a bare LF is rejected.
    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => invalid("invalid chunk extension contains newline"),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    fn read_size_lf(src: &mut BytesMut, size: u64) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' if size == 0 => Poll::Ready(Ok(Trailers)),
            b'\n' => Poll::Ready(Ok(Body)),
            _ => invalid("invalid chunk size LF"),
        }
    }

    fn read_body(src: &mut BytesMut, remaining: &mut u64, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, io::Error>> {
        if *remaining == 0 {
            return Poll::Ready(Ok(BodyCr));
        }

        let read_size = usize::try_from(*remaining).unwrap_or(usize::MAX).min(src.len());
        *remaining -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if *remaining > 0 {
            Poll::Ready(Ok(Body))
        } else {
            Poll::Ready(Ok(BodyCr))
        }
    }

    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => invalid("invalid chunk body CR"),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => invalid("invalid chunk body LF"),
        }
    }
}
