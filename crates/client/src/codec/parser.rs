//! Buffered response parser driven by the connection.
//!
//! [`ResponseParser`] owns the read buffer. Bytes are either appended with
//! [`feed`](ResponseParser::feed) or read straight into
//! [`buffer_mut`](ResponseParser::buffer_mut) and then decoded with
//! [`advance`](ResponseParser::advance). Every event decodable from the buffered
//! bytes is appended to the caller's queue before the call returns, so how the
//! stream was split into reads never changes the event sequence.

use std::collections::VecDeque;

use bytes::BytesMut;
use http::Method;
use tokio_util::codec::Decoder;
use tracing::{trace, warn};

use crate::codec::header::DEFAULT_MAX_HEADER_BYTES;
use crate::codec::ResponseDecoder;
use crate::protocol::{ParseError, ParserEvent};

/// Result of handing bytes to the parser.
#[derive(Debug)]
pub enum FeedOutcome {
    /// Every buffered byte was turned into events or is waiting for more input
    ConsumedAll,
    /// The connection switched protocols; the remainder travels in `ParserEvent::Upgrade`
    PausedForUpgrade,
    /// The stream is malformed; the parser stays failed
    Error(ParseError),
}

#[derive(Debug)]
pub struct ResponseParser {
    buffer: BytesMut,
    decoder: ResponseDecoder,
    failure: Option<ParseError>,
}

impl ResponseParser {
    pub fn new(max_header_size: usize, read_buffer_size: usize) -> Self {
        Self { buffer: BytesMut::with_capacity(read_buffer_size), decoder: ResponseDecoder::new(max_header_size), failure: None }
    }

    /// Registers the method of a request just written, see [`ResponseDecoder::expect_response`].
    pub fn expect_response(&mut self, method: Method, upgrade: bool) {
        self.decoder.expect_response(method, upgrade);
    }

    /// Written requests still waiting for a final response.
    pub fn expected(&self) -> usize {
        self.decoder.expected()
    }

    /// Returns true when no response is partially parsed and no bytes are buffered.
    pub fn is_at_boundary(&self) -> bool {
        self.decoder.is_idle() && self.buffer.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Read buffer for callers that read from the socket directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Appends `bytes` and decodes everything possible into `events`.
    pub fn feed(&mut self, bytes: &[u8], events: &mut VecDeque<ParserEvent>) -> FeedOutcome {
        if let Some(failure) = &self.failure {
            return FeedOutcome::Error(failure.replicate());
        }
        if !self.decoder.is_upgraded() {
            self.buffer.extend_from_slice(bytes);
        }
        self.advance(events)
    }

    /// Decodes the bytes already in the buffer into `events`.
    pub fn advance(&mut self, events: &mut VecDeque<ParserEvent>) -> FeedOutcome {
        self.drive(events, false)
    }

    /// Signals that the peer closed the stream.
    ///
    /// Completes a read-until-close body, is a no-op at a message boundary,
    /// and fails with `ParseError::UnexpectedEof` in the middle of a message.
    pub fn feed_eof(&mut self, events: &mut VecDeque<ParserEvent>) -> FeedOutcome {
        self.drive(events, true)
    }

    fn drive(&mut self, events: &mut VecDeque<ParserEvent>, eof: bool) -> FeedOutcome {
        if let Some(failure) = &self.failure {
            return FeedOutcome::Error(failure.replicate());
        }

        if self.decoder.is_upgraded() {
            return FeedOutcome::PausedForUpgrade;
        }

        loop {
            let decoded = if eof { self.decoder.decode_eof(&mut self.buffer) } else { self.decoder.decode(&mut self.buffer) };

            match decoded {
                Ok(Some(event)) => {
                    trace!(data_len = event.data_len(), "parser event");
                    let upgrade = matches!(event, ParserEvent::Upgrade(_));
                    events.push_back(event);
                    if upgrade {
                        return FeedOutcome::PausedForUpgrade;
                    }
                }
                Ok(None) => return FeedOutcome::ConsumedAll,
                Err(e) => {
                    warn!(cause = %e, "failed to parse response");
                    self.failure = Some(e.replicate());
                    return FeedOutcome::Error(e);
                }
            }
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, 8 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use indoc::indoc;

    const PIPELINED: &str = indoc! {"
        HTTP/1.1 200 OK\r
        Content-Type: text/plain\r
        Content-Length: 12\r
        \r
        hello world!HTTP/1.1 200 OK\r
        Transfer-Encoding: chunked\r
        \r
        5\r
        first\r
        6\r
        second\r
        0\r
        Trailer-Field: yes\r
        \r
    "};

    /// Merges adjacent `Data` events so sequences can be compared across read splits.
    fn normalize(events: VecDeque<ParserEvent>) -> Vec<ParserEvent> {
        let mut out: Vec<ParserEvent> = Vec::new();
        for event in events {
            match (out.last_mut(), event) {
                (Some(ParserEvent::Data(prev)), ParserEvent::Data(next)) => {
                    let mut joined = BytesMut::from(&prev[..]);
                    joined.extend_from_slice(&next);
                    *prev = joined.freeze();
                }
                (_, event) => out.push(event),
            }
        }
        out
    }

    fn parser() -> ResponseParser {
        let mut parser = ResponseParser::default();
        parser.expect_response(Method::GET, false);
        parser.expect_response(Method::GET, false);
        parser
    }

    #[test]
    fn one_byte_feeds_match_one_large_feed() {
        let mut whole = VecDeque::new();
        assert!(matches!(parser().feed(PIPELINED.as_bytes(), &mut whole), FeedOutcome::ConsumedAll));

        let mut parser = parser();
        let mut split = VecDeque::new();
        for byte in PIPELINED.as_bytes() {
            assert!(matches!(parser.feed(&[*byte], &mut split), FeedOutcome::ConsumedAll));
        }

        let whole = normalize(whole);
        assert_eq!(whole, normalize(split));
        assert_eq!(whole.iter().filter(|e| **e == ParserEvent::MessageComplete).count(), 2);
        assert!(whole.contains(&ParserEvent::Data(Bytes::from_static(b"hello world!"))));
        assert!(whole.contains(&ParserEvent::Data(Bytes::from_static(b"firstsecond"))));
        assert!(parser.is_at_boundary());
    }

    #[test]
    fn oversized_header_split_byte_by_byte() {
        let mut parser = ResponseParser::new(1024, 64);
        parser.expect_response(Method::GET, false);

        let mut input = b"HTTP/1.1 200 OK\r\nX-Filler: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(2048));
        input.extend_from_slice(b"\r\n\r\n");

        let mut events = VecDeque::new();
        let mut failed_at = None;
        for (i, byte) in input.iter().enumerate() {
            if let FeedOutcome::Error(e) = parser.feed(&[*byte], &mut events) {
                assert!(matches!(e, ParseError::TooLargeHeader { .. }));
                failed_at = Some(i);
                break;
            }
        }

        assert_eq!(failed_at, Some(1024));
        assert!(!events.iter().any(|e| matches!(e, ParserEvent::Headers(_))));

        // permanently failed with the same error class
        let outcome = parser.feed(b"more", &mut events);
        assert!(matches!(outcome, FeedOutcome::Error(ParseError::TooLargeHeader { .. })));
        assert!(parser.is_failed());
    }

    #[test]
    fn eof_at_boundary_and_mid_message() {
        let mut parser = ResponseParser::default();
        let mut events = VecDeque::new();
        assert!(matches!(parser.feed_eof(&mut events), FeedOutcome::ConsumedAll));
        assert!(events.is_empty());

        let mut parser = ResponseParser::default();
        parser.expect_response(Method::GET, false);
        parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab", &mut events);
        let outcome = parser.feed_eof(&mut events);
        assert!(matches!(outcome, FeedOutcome::Error(ParseError::UnexpectedEof)));
    }

    #[test]
    fn informational_then_close() {
        let mut parser = ResponseParser::default();
        parser.expect_response(Method::POST, false);
        let mut events = VecDeque::new();

        parser.feed(b"HTTP/1.1 100 Continue\r\n\r\n", &mut events);
        assert_eq!(events.back(), Some(&ParserEvent::MessageComplete));
        assert_eq!(parser.expected(), 1);

        // the final response never arrived; the connection reports it
        assert!(matches!(parser.feed_eof(&mut events), FeedOutcome::ConsumedAll));
        assert_eq!(parser.expected(), 1);
    }

    #[test]
    fn until_close_body_completes_on_eof() {
        let mut parser = ResponseParser::default();
        parser.expect_response(Method::GET, false);
        let mut events = VecDeque::new();

        parser.feed(b"HTTP/1.0 200 OK\r\n\r\nstreamed", &mut events);
        assert_ne!(events.back(), Some(&ParserEvent::MessageComplete));

        assert!(matches!(parser.feed_eof(&mut events), FeedOutcome::ConsumedAll));
        assert_eq!(events.back(), Some(&ParserEvent::MessageComplete));
    }

    #[test]
    fn upgrade_pauses() {
        let mut parser = ResponseParser::default();
        parser.expect_response(Method::GET, true);
        let mut events = VecDeque::new();

        let outcome = parser.feed(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\n\r\nraw bytes", &mut events);
        assert!(matches!(outcome, FeedOutcome::PausedForUpgrade));
        assert_eq!(events.back(), Some(&ParserEvent::Upgrade(Bytes::from_static(b"raw bytes"))));
        assert!(matches!(parser.feed(b"ignored", &mut events), FeedOutcome::PausedForUpgrade));
    }
}
