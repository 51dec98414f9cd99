//! Core HTTP protocol types for the client side of a connection.
//!
//! # Architecture
//!
//! - **Messages** ([`message`]): write-side [`Message`] and [`PayloadItem`],
//!   [`PayloadSize`] framing, and the [`ParserEvent`]s produced by the response parser
//! - **Requests** ([`request`], [`body`]): [`RequestDescriptor`] and its [`RequestBody`] source
//! - **Responses** ([`response`]): [`ResponseHead`] with derived [`HeadFlags`]
//! - **Headers** ([`header`]): the ordered [`HeaderList`]
//! - **Errors** ([`error`]): [`ClientError`] delivered to handlers, plus the
//!   codec level [`ParseError`] and [`SendError`]

pub mod message;
pub use message::Message;
pub use message::ParserEvent;
pub use message::PayloadItem;
pub use message::PayloadSize;

pub mod header;
pub use header::HeaderList;

pub mod request;
pub use request::RequestDescriptor;

pub mod response;
pub use response::HeadFlags;
pub use response::ResponseHead;

pub mod body;
pub use body::BoxError;
pub use body::RequestBody;

pub mod error;
pub use error::ClientError;
pub use error::ParseError;
pub use error::SendError;
