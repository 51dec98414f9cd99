//! Retrying requests on top of any [`Dispatch`] implementation.
//!
//! [`RetryDispatcher`] has the same `dispatch` signature as the connection it
//! wraps and only observes handler callbacks. A failed attempt is re-issued
//! after the delay chosen by the [`RetryPolicy`], as long as doing so is safe:
//!
//! - the method is idempotent, or no response was seen, or no body byte has
//!   reached the consumer yet
//! - the request body can be replayed
//! - the caller did not abort
//!
//! When a response breaks off after part of its body was delivered and it
//! carried a strong `ETag`, the next attempt asks for the rest with `Range`
//! and `If-Match`, and the remaining bytes are appended to the same body.

mod handler;
mod policy;

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

pub use policy::{Backoff, RetryContext, RetryPolicy};

use crate::dispatch::{Dispatch, DispatchError};
use crate::handler::Handler;
use crate::protocol::RequestDescriptor;
use crate::retry::handler::{Detached, RetryHandler, RetryState, Slot};

/// A [`Dispatch`] decorator that retries failed requests.
///
/// ```no_run
/// use micro_client::handler::buffered;
/// use micro_client::protocol::RequestDescriptor;
/// use micro_client::{Client, ClientConfig, Dispatch, RetryDispatcher, RetryPolicy};
/// use tokio::net::TcpStream;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::connect(TcpStream::connect("127.0.0.1:8080"), ClientConfig::default());
/// let retrying = RetryDispatcher::new(client, RetryPolicy::default().max_retries(3));
///
/// let (handler, response) = buffered();
/// retrying.dispatch(RequestDescriptor::get("/"), Box::new(handler))?;
/// let _response = response.await??;
/// # Ok(())
/// # }
/// ```
pub struct RetryDispatcher<D> {
    inner: Arc<D>,
    policy: Arc<RetryPolicy>,
}

impl<D> RetryDispatcher<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner: Arc::new(inner), policy: Arc::new(policy) }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<D> Clone for RetryDispatcher<D> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), policy: Arc::clone(&self.policy) }
    }
}

impl<D: fmt::Debug> fmt::Debug for RetryDispatcher<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryDispatcher").field("inner", &self.inner).field("policy", &self.policy).finish()
    }
}

impl<D> Dispatch for RetryDispatcher<D>
where
    D: Dispatch + Send + Sync + 'static,
{
    /// Dispatches the first attempt.
    ///
    /// A rejection of the first attempt is returned to the caller as is, with
    /// the caller's own handler. Rejections of later attempts count as failures.
    fn dispatch(&self, request: RequestDescriptor, consumer: Box<dyn Handler>) -> Result<(), DispatchError> {
        let template = request.try_clone();
        trace!(method = %request.method(), replayable = template.is_some(), "dispatch with retry");

        let state = RetryState::new(consumer, Arc::clone(&self.inner), Arc::clone(&self.policy), template);
        let slot: Slot<D> = Arc::new(Mutex::new(Some(state)));

        self.inner.dispatch(request, Box::new(RetryHandler::new(Arc::clone(&slot)))).map_err(|e| {
            let (reason, attempt) = e.into_parts();
            drop(attempt);
            match handler::take(&slot) {
                Some(state) => DispatchError::new(reason, state.into_consumer()),
                // the inner dispatcher resolved the attempt before rejecting it
                None => DispatchError::new(reason, Box::new(Detached)),
            }
        })
    }
}
