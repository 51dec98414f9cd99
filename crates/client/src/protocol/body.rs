//! Request body sources.
//!
//! A request body is either absent, a fixed buffer, or a streaming
//! `http_body::Body`. Streaming bodies whose `size_hint` is exact are framed
//! with `Content-Length`; all others use chunked transfer encoding.

use std::error::Error;
use std::fmt;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::Method;
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};

use crate::protocol::PayloadSize;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// The body source of a [`RequestDescriptor`](crate::protocol::RequestDescriptor).
pub enum RequestBody {
    Empty,
    Full(Bytes),
    Stream { body: UnsyncBoxBody<Bytes, BoxError>, length: Option<u64> },
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Empty
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        RequestBody::Full(bytes.into())
    }

    /// Wraps any `http_body::Body`; its exact size hint, if any, becomes the content length.
    pub fn body<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let length = body.size_hint().exact();
        RequestBody::Stream { body: body.map_err(Into::<BoxError>::into).boxed_unsync(), length }
    }

    /// Wraps a stream of unknown total length, sent with chunked framing.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let body = StreamBody::new(stream.map(|item| item.map(Frame::data).map_err(Into::<BoxError>::into)));
        RequestBody::Stream { body: body.boxed_unsync(), length: None }
    }

    /// Wraps a stream that must yield exactly `length` bytes.
    pub fn sized_stream<S, E>(length: u64, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        match Self::stream(stream) {
            RequestBody::Stream { body, .. } => RequestBody::Stream { body, length: Some(length) },
            other => other,
        }
    }

    /// Returns true for streaming bodies whose length is not known upfront.
    pub fn is_unknown_length(&self) -> bool {
        matches!(self, RequestBody::Stream { length: None, .. })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream { .. })
    }

    /// Length of the body if it is known before sending.
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Full(bytes) => Some(bytes.len() as u64),
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// Chooses the wire framing for this body.
    ///
    /// Methods that carry a payload get an explicit `Content-Length: 0` when the body is empty.
    pub fn payload_size(&self, method: &Method) -> PayloadSize {
        match self.length() {
            Some(0) if expects_payload(method) => PayloadSize::Length(0),
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }

    /// Returns a copy of the body if it can be replayed.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Full(bytes) => Some(RequestBody::Full(bytes.clone())),
            RequestBody::Stream { .. } => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            RequestBody::Stream { length, .. } => f.debug_struct("Stream").field("length", length).finish_non_exhaustive(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Full(bytes)
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Full(Bytes::from(v))
    }
}

/// Methods whose requests carry a payload by convention.
pub(crate) fn expects_payload(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}
