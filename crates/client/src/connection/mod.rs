//! HTTP/1.1 client connection.
//!
//! A connection is one tokio task that owns the socket, the request queue,
//! the response parser and a single timer. [`Client`] handles talk to it over
//! an unbounded command channel and read the state it publishes through atomics.
//!
//! # Components
//!
//! - [`Client`]: the cloneable handle implementing [`Dispatch`](crate::Dispatch)
//! - [`RequestQueue`]: requests in dispatch order, each a [`QueueEntry`]
//! - `HttpConnection`: the task loop deciding what to write, read and deliver
//! - `Demultiplexer`: routes parser events to the handler of the head entry
//! - [`PipelinePolicy`]: pipelining depth and keep-alive derived from responses
//!
//! Requests are written in queue order while fewer than the pipelining depth
//! are waiting for a response. A failure that leaves the byte stream unusable
//! resolves every pending request with the same error and closes the socket.

mod client;
mod command;
mod demux;
mod http_connection;
mod message_writer;
mod phase;
mod queue;

pub use client::Client;
pub(crate) use command::Command;
pub use phase::{ConnectionPhase, PipelinePolicy};
pub use queue::{EntryId, QueueEntry, RequestQueue, ResponseState, WriteState};
