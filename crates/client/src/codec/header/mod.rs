//! Head processing for both directions.
//!
//! - [`HeaderDecoder`]: decodes response heads and derives keep-alive and framing flags
//! - [`HeaderEncoder`]: encodes request heads with the connection-managed fields

mod header_decoder;
mod header_encoder;

pub use header_decoder::{resolve_framing, HeaderDecoder, DEFAULT_MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use header_encoder::{HeaderEncoder, RequestHead};
