//! The dispatch contract shared by [`Client`](crate::Client) and
//! [`RetryDispatcher`](crate::retry::RetryDispatcher).

use std::fmt;

use thiserror::Error;

use crate::handler::Handler;
use crate::protocol::{ClientError, RequestDescriptor};

/// Accepts a request and the handler that will observe its outcome.
///
/// Acceptance is synchronous. Once `dispatch` returns `Ok`, the handler gets
/// exactly one terminal callback. A rejected request never touches its handler;
/// the handler travels back inside the [`DispatchError`].
pub trait Dispatch {
    /// # Errors
    ///
    /// Returns a [`DispatchError`] carrying the handler when the request is not accepted.
    fn dispatch(&self, request: RequestDescriptor, handler: Box<dyn Handler>) -> Result<(), DispatchError>;
}

impl<T: Dispatch + ?Sized> Dispatch for std::sync::Arc<T> {
    fn dispatch(&self, request: RequestDescriptor, handler: Box<dyn Handler>) -> Result<(), DispatchError> {
        (**self).dispatch(request, handler)
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{0}")]
    InvalidArgument(ClientError),

    #[error("connection is closed")]
    Closed,

    #[error("connection is draining")]
    Draining,

    #[error("pipeline is full and the request body has unknown length")]
    Busy,
}

/// A refused dispatch, handing the handler back to the caller.
#[derive(Error)]
#[error("request rejected: {reason}")]
pub struct DispatchError {
    reason: Rejection,
    handler: Box<dyn Handler>,
}

impl DispatchError {
    pub(crate) fn new(reason: Rejection, handler: Box<dyn Handler>) -> Self {
        Self { reason, handler }
    }

    pub fn reason(&self) -> &Rejection {
        &self.reason
    }

    pub fn into_handler(self) -> Box<dyn Handler> {
        self.handler
    }

    pub fn into_parts(self) -> (Rejection, Box<dyn Handler>) {
        (self.reason, self.handler)
    }

    /// The error a handler would observe had the request been accepted.
    pub fn to_client_error(&self) -> ClientError {
        match &self.reason {
            Rejection::InvalidArgument(e) => e.clone(),
            Rejection::Closed | Rejection::Draining => ClientError::Closed,
            Rejection::Busy => ClientError::invalid_argument("pipeline is full"),
        }
    }
}

impl fmt::Debug for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchError").field("reason", &self.reason).finish_non_exhaustive()
    }
}
