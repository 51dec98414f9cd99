//! An asynchronous pipelined HTTP/1.1 client connection
//!
//! This crate provides one persistent HTTP/1.1 connection built on tokio. Requests
//! are queued on the connection, written as soon as the pipelining policy allows,
//! and the responses coming back are routed, in order, to the [`handler::Handler`]
//! of each request.
//!
//! # Features
//!
//! - Request pipelining with a depth that clamps to 1 once the server disallows it
//! - Keep-alive with server advertised idle timeouts
//! - Streaming request bodies, chunked when the length is unknown
//! - Response backpressure through `on_data` return values and resume handles
//! - Per-request abort, and connection-wide error fan-out
//! - Protocol upgrades handing the raw socket to the caller
//! - An optional [`RetryDispatcher`] resuming partial bodies with range requests
//!
//! # Example
//!
//! ```no_run
//! use micro_client::handler::buffered;
//! use micro_client::protocol::RequestDescriptor;
//! use micro_client::{Client, ClientConfig, Dispatch};
//! use tokio::net::TcpStream;
//! use tracing::{error, info, Level};
//! use tracing_subscriber::FmtSubscriber;
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let config = ClientConfig::default().pipelining(4).authority("127.0.0.1:8080");
//!     let client = Client::connect(TcpStream::connect("127.0.0.1:8080"), config);
//!
//!     let mut responses = Vec::new();
//!     for path in ["/a", "/b", "/c"] {
//!         let (handler, response) = buffered();
//!         if let Err(e) = client.dispatch(RequestDescriptor::get(path), Box::new(handler)) {
//!             error!(cause = %e, "dispatch rejected");
//!             continue;
//!         }
//!         responses.push(response);
//!     }
//!
//!     for response in responses {
//!         match response.await {
//!             Ok(Ok(response)) => info!(status = %response.head.status(), len = response.body.len(), "response"),
//!             Ok(Err(e)) => error!(cause = %e, "request failed"),
//!             Err(_) => error!("handler dropped"),
//!         }
//!     }
//!
//!     client.close();
//!     client.closed().await;
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`connection`]: the connection task, its request queue and the response demultiplexer
//! - [`codec`]: request encoding and the incremental response parser
//! - [`protocol`]: request descriptors, response heads, parser events and errors
//! - [`handler`]: the callbacks a request reports to, with abort and resume handles
//! - [`dispatch`]: the [`Dispatch`] contract shared by connections and decorators
//! - [`retry`]: the retry decorator and its policy
//! - [`config`]: connection tunables
//!
//! # Error Handling
//!
//! - [`protocol::ClientError`]: delivered to handlers through `on_error`
//! - [`DispatchError`]: synchronous rejection, handing the handler back
//! - [`protocol::ParseError`] and [`protocol::SendError`]: codec level errors
//!   converted into `ClientError` by the connection
//!
//! # Limitations
//!
//! - HTTP/1.1 only, no TLS; the caller supplies a connected socket
//! - One socket per [`Client`]; pooling across connections is left to the caller

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod retry;

mod utils;
pub(crate) use utils::ensure;

pub use config::ClientConfig;
pub use connection::Client;
pub use dispatch::{Dispatch, DispatchError, Rejection};
pub use retry::{RetryDispatcher, RetryPolicy};
