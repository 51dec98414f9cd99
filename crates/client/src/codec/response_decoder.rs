//! HTTP response decoder.
//!
//! Turns the byte stream of a connection into [`ParserEvent`]s. Each final
//! response is matched, in order, with a request registered through
//! [`ResponseDecoder::expect_response`]; the request method decides whether the
//! response can carry a body and whether it may switch protocols.
//!
//! # State Machine
//!
//! ```text
//! Idle -> Head -> Body -> (Trailers) -> Idle
//!            \-> Upgraded
//! ```
//!
//! Informational (1xx) responses produce a full event sequence without body
//! and keep the request expectation in place for the final response.

use std::collections::VecDeque;

use bytes::BytesMut;
use http::Method;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::codec::body::PayloadDecoder;
use crate::codec::header::{resolve_framing, HeaderDecoder, DEFAULT_MAX_HEADER_BYTES};
use crate::ensure;
use crate::protocol::{HeaderList, ParseError, ParserEvent, PayloadItem};

/// A request written on the connection, waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expectation {
    method: Method,
    upgrade: bool,
}

#[derive(Debug)]
enum State {
    /// Between messages
    Idle,
    /// `MessageBegin` was emitted, the head is incomplete
    Head,
    /// Decoding the body of the current response
    Body { decoder: PayloadDecoder, informational: bool },
    /// Trailers were emitted, `MessageComplete` is next
    Complete,
    /// Headers of a protocol switch were emitted, the rest of the stream is not HTTP
    Upgrade,
    /// The remainder was handed out; nothing more is decoded
    Upgraded,
}

/// Decoder for a stream of responses implementing the [`Decoder`] trait.
#[derive(Debug)]
pub struct ResponseDecoder {
    header_decoder: HeaderDecoder,
    expectations: VecDeque<Expectation>,
    state: State,
}

impl ResponseDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(max_header_size), expectations: VecDeque::new(), state: State::Idle }
    }

    /// Registers a request written to the connection, in write order.
    pub fn expect_response(&mut self, method: Method, upgrade: bool) {
        self.expectations.push_back(Expectation { method, upgrade });
    }

    /// Number of written requests without a final response yet.
    pub fn expected(&self) -> usize {
        self.expectations.len()
    }

    /// Returns true between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Returns true once the connection switched protocols.
    pub fn is_upgraded(&self) -> bool {
        matches!(self.state, State::Upgrade | State::Upgraded)
    }

    fn finish_body(&mut self, mut decoder: PayloadDecoder, informational: bool) -> ParserEvent {
        let trailers: HeaderList = decoder.take_trailers();
        if !informational {
            self.expectations.pop_front();
        }
        if trailers.is_empty() {
            self.state = State::Idle;
            ParserEvent::MessageComplete
        } else {
            self.state = State::Complete;
            ParserEvent::Trailers(trailers)
        }
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl Decoder for ResponseDecoder {
    type Item = ParserEvent;
    type Error = ParseError;

    /// Decodes the next event from `src`.
    ///
    /// # Errors
    ///
    /// Besides head and body errors, returns `ParseError::UnexpectedResponse`
    /// when bytes arrive while no request waits for a response, and
    /// `ParseError::UnexpectedUpgrade` for a `101` nobody asked for.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                if src.is_empty() {
                    return Ok(None);
                }
                ensure!(!self.expectations.is_empty(), ParseError::UnexpectedResponse);
                self.state = State::Head;
                Ok(Some(ParserEvent::MessageBegin))
            }

            State::Head => {
                let Some(mut head) = self.header_decoder.decode(src)? else {
                    self.state = State::Head;
                    return Ok(None);
                };

                let expectation = self.expectations.front().ok_or(ParseError::UnexpectedResponse)?;
                resolve_framing(&mut head, &expectation.method, expectation.upgrade)?;
                trace!(status = head.status().as_u16(), payload = ?head.payload_size(), "decoded response head");

                self.state = if head.is_upgrade() {
                    debug!(status = head.status().as_u16(), "connection switches protocols");
                    self.expectations.pop_front();
                    State::Upgrade
                } else {
                    let decoder = PayloadDecoder::from_payload_size(head.payload_size(), self.header_decoder.max_header_size());
                    State::Body { decoder, informational: head.is_informational() }
                };

                Ok(Some(ParserEvent::Headers(head)))
            }

            State::Body { mut decoder, informational } => match decoder.decode(src)? {
                Some(PayloadItem::Chunk(bytes)) => {
                    self.state = State::Body { decoder, informational };
                    Ok(Some(ParserEvent::Data(bytes)))
                }
                Some(PayloadItem::Eof) => Ok(Some(self.finish_body(decoder, informational))),
                None => {
                    self.state = State::Body { decoder, informational };
                    Ok(None)
                }
            },

            State::Complete => Ok(Some(ParserEvent::MessageComplete)),

            State::Upgrade => {
                self.state = State::Upgraded;
                Ok(Some(ParserEvent::Upgrade(src.split().freeze())))
            }

            State::Upgraded => {
                self.state = State::Upgraded;
                Ok(None)
            }
        }
    }

    /// Decodes after the peer closed the stream.
    ///
    /// Completes a read-until-close body; anything else in the middle of a
    /// message is `ParseError::UnexpectedEof`. At a message boundary it yields `None`.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle if src.is_empty() => Ok(None),
            State::Head => {
                self.state = State::Head;
                match self.decode(src)? {
                    Some(event) => Ok(Some(event)),
                    None => Err(ParseError::UnexpectedEof),
                }
            }
            State::Body { mut decoder, informational } => match decoder.decode_eof(src)? {
                Some(PayloadItem::Chunk(bytes)) => {
                    self.state = State::Body { decoder, informational };
                    Ok(Some(ParserEvent::Data(bytes)))
                }
                Some(PayloadItem::Eof) => Ok(Some(self.finish_body(decoder, informational))),
                None => Err(ParseError::UnexpectedEof),
            },
            state => {
                self.state = state;
                self.decode(src)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use indoc::indoc;

    fn decode_all(decoder: &mut ResponseDecoder, src: &mut BytesMut) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        while let Some(event) = decoder.decode(src).unwrap() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[ParserEvent]) -> Vec<u16> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Headers(head) => Some(head.status().as_u16()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pipelined_responses() {
        let str = indoc! {"
            HTTP/1.1 200 OK\r
            Content-Length: 5\r
            \r
            helloHTTP/1.1 404 Not Found\r
            Content-Length: 0\r
            \r
        "};

        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, false);
        decoder.expect_response(Method::GET, false);

        let mut src = BytesMut::from(str);
        let events = decode_all(&mut decoder, &mut src);

        assert_eq!(statuses(&events), [200, 404]);
        assert_eq!(events[2], ParserEvent::Data(Bytes::from_static(b"hello")));
        assert_eq!(events.iter().filter(|e| **e == ParserEvent::MessageComplete).count(), 2);
        assert_eq!(decoder.expected(), 0);
        assert!(decoder.is_idle());
    }

    #[test]
    fn head_response_has_no_body() {
        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::HEAD, false);

        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n");
        let events = decode_all(&mut decoder, &mut src);

        assert!(matches!(events.as_slice(), [ParserEvent::MessageBegin, ParserEvent::Headers(_), ParserEvent::MessageComplete]));
    }

    #[test]
    fn informational_keeps_expectation() {
        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::POST, false);

        let mut src = BytesMut::from("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
        let events = decode_all(&mut decoder, &mut src);

        assert_eq!(statuses(&events), [100, 201]);
        assert_eq!(decoder.expected(), 0);
    }

    #[test]
    fn chunked_with_trailers() {
        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, false);

        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 1\r\n\r\n");
        let events = decode_all(&mut decoder, &mut src);

        assert_eq!(events[2], ParserEvent::Data(Bytes::from_static(b"abc")));
        assert!(matches!(&events[3], ParserEvent::Trailers(t) if t.get("x-sum").is_some()));
        assert_eq!(events[4], ParserEvent::MessageComplete);
    }

    #[test]
    fn unexpected_response() {
        let mut decoder = ResponseDecoder::default();
        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\n\r\n");
        assert!(matches!(decoder.decode(&mut src), Err(ParseError::UnexpectedResponse)));
    }

    #[test]
    fn upgrade_hands_out_remainder() {
        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, true);

        let mut src = BytesMut::from(&b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x05hello"[..]);
        let events = decode_all(&mut decoder, &mut src);

        assert!(matches!(events[1], ParserEvent::Headers(ref head) if head.is_upgrade()));
        assert_eq!(events[2], ParserEvent::Upgrade(Bytes::from_static(b"\x81\x05hello")));
        assert!(decoder.is_upgraded());
    }

    #[test]
    fn eof_handling() {
        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, false);
        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\n\r\nuntil close");
        let mut events = decode_all(&mut decoder, &mut src);
        while let Some(event) = decoder.decode_eof(&mut src).unwrap() {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&ParserEvent::MessageComplete));
        assert!(decoder.decode_eof(&mut src).unwrap().is_none());

        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, false);
        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        decode_all(&mut decoder, &mut src);
        assert!(matches!(decoder.decode_eof(&mut src), Err(ParseError::UnexpectedEof)));

        let mut decoder = ResponseDecoder::default();
        decoder.expect_response(Method::GET, false);
        let mut src = BytesMut::from("HTTP/1.1 200 OK\r\nContent-");
        decode_all(&mut decoder, &mut src);
        assert!(matches!(decoder.decode_eof(&mut src), Err(ParseError::UnexpectedEof)));
    }
}
