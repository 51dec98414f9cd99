//! HTTP/1.1 codec for the client side of a connection.
//!
//! # Architecture
//!
//! - Request side:
//!   - [`RequestEncoder`]: serializes a request head and its body pieces
//!   - head serialization via `HeaderEncoder`
//!   - body framing via `PayloadEncoder`
//!
//! - Response side:
//!   - [`ResponseDecoder`]: turns response bytes into [`ParserEvent`](crate::protocol::ParserEvent)s,
//!     matching each response with the request it answers
//!   - [`ResponseParser`]: the buffered `feed` adapter the connection drives
//!
//! # Example
//!
//! ```
//! use std::collections::VecDeque;
//! use http::Method;
//! use micro_client::codec::{FeedOutcome, ResponseParser};
//! use micro_client::protocol::ParserEvent;
//!
//! let mut parser = ResponseParser::default();
//! parser.expect_response(Method::GET, false);
//!
//! let mut events = VecDeque::new();
//! let outcome = parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi", &mut events);
//!
//! assert!(matches!(outcome, FeedOutcome::ConsumedAll));
//! assert!(matches!(events.back(), Some(ParserEvent::MessageComplete)));
//! ```

use std::io;

use bytes::{BufMut, BytesMut};

mod body;
mod header;
mod parser;
mod request_encoder;
mod response_decoder;

pub use header::{RequestHead, DEFAULT_MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use parser::{FeedOutcome, ResponseParser};
pub use request_encoder::RequestEncoder;
pub use response_decoder::ResponseDecoder;

/// `io::Write` adapter appending to a `BytesMut`, used for formatted output.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
