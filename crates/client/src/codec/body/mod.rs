//! Body framing for both directions.
//!
//! ## Decoders (responses)
//! - [`PayloadDecoder`]: fixed length, chunked with trailers, read until close, or no body
//!
//! ## Encoders (requests)
//! - [`PayloadEncoder`]: `Content-Length` or chunked framing, with length checking

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
