//! The handler given to each attempt of a retried request.
//!
//! Every attempt gets a fresh [`RetryHandler`] sharing one [`RetryState`]
//! slot. The state owns the consumer's handler, so whichever attempt ends the
//! request is the one that delivers the terminal callback. Callbacks arrive
//! on connection tasks, and the next attempt is dispatched from a spawned
//! task after the backoff delay.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatch;
use crate::handler::{AbortHandle, Handler, ResumeHandle, SharedAbort, Upgraded};
use crate::protocol::{ClientError, HeaderList, RequestDescriptor, ResponseHead};
use crate::retry::policy::{parse_retry_after, RetryContext, RetryPolicy};

/// Everything that outlives a single attempt.
pub(crate) struct RetryState<D> {
    consumer: Box<dyn Handler>,
    dispatcher: Arc<D>,
    policy: Arc<RetryPolicy>,
    /// Replayable copy of the request; `None` if the body can't be sent twice
    template: Option<RequestDescriptor>,
    retries: u32,
    total_delay: Duration,
    connected: bool,
    /// Status of the response whose head reached the consumer
    delivered_status: Option<StatusCode>,
    /// Body bytes the consumer has received
    delivered: u64,
    etag: Option<HeaderValue>,
    abort: Arc<SharedAbort>,
    resume: Arc<ArcSwapOption<ResumeHandle>>,
}

pub(crate) type Slot<D> = Arc<Mutex<Option<RetryState<D>>>>;

impl<D> RetryState<D>
where
    D: Dispatch + Send + Sync + 'static,
{
    pub(crate) fn new(consumer: Box<dyn Handler>, dispatcher: Arc<D>, policy: Arc<RetryPolicy>, template: Option<RequestDescriptor>) -> Self {
        Self {
            consumer,
            dispatcher,
            policy,
            template,
            retries: 0,
            total_delay: Duration::ZERO,
            connected: false,
            delivered_status: None,
            delivered: 0,
            etag: None,
            abort: Arc::new(SharedAbort::default()),
            resume: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub(crate) fn into_consumer(self) -> Box<dyn Handler> {
        self.consumer
    }

    /// Ends the request with `error` or schedules another attempt.
    fn fail(mut self, error: ClientError, response_seen: bool) {
        match self.next_delay(&error, response_seen) {
            Some(delay) => {
                self.retries += 1;
                self.total_delay += delay;
                info!(attempt = self.retries, delay = ?delay, cause = %error, "retrying request");
                tokio::spawn(self.retry_after(delay));
            }
            None => self.consumer.on_error(error),
        }
    }

    fn next_delay(&self, error: &ClientError, response_seen: bool) -> Option<Duration> {
        if error.is_abort() || self.abort.token().is_cancelled() {
            return None;
        }
        let template = self.template.as_ref()?;

        let safe = template.is_idempotent() || !response_seen || self.delivered == 0;
        if !safe {
            debug!(cause = %error, "request is not safe to retry");
            return None;
        }
        if self.delivered > 0 && (self.etag.is_none() || template.headers().contains(header::RANGE.as_str())) {
            debug!(delivered = self.delivered, "partial response can't be resumed");
            return None;
        }

        let ctx = RetryContext { attempt: self.retries + 1, total_delay: self.total_delay, method: template.method() };
        self.policy.delay(error, &ctx)
    }

    async fn retry_after(mut self, delay: Duration) {
        let token = self.abort.token().clone();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => {
                let reason = self.abort.reason();
                self.consumer.on_error(ClientError::Aborted { reason });
                return;
            }
        }
        self.dispatch_next();
    }

    /// Dispatches the next attempt; a rejection counts as a failed attempt.
    fn dispatch_next(self) {
        let Some(mut request) = self.template.as_ref().and_then(RequestDescriptor::try_clone) else {
            self.consumer_error(ClientError::Closed);
            return;
        };

        if self.delivered > 0 {
            if let Some(etag) = &self.etag {
                let headers = request.headers_mut();
                headers.append(header::RANGE, range_from(self.delivered));
                headers.append(header::IF_MATCH, etag.clone());
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let slot: Slot<D> = Arc::new(Mutex::new(Some(self)));
        let handler = RetryHandler::new(Arc::clone(&slot));

        if let Err(e) = dispatcher.dispatch(request, Box::new(handler)) {
            let error = e.to_client_error();
            warn!(cause = %e, "retry attempt rejected");
            drop(e);
            if let Some(state) = take(&slot) {
                state.fail(error, false);
            }
        }
    }

    fn consumer_error(mut self, error: ClientError) {
        self.consumer.on_error(error);
    }
}

fn range_from(offset: u64) -> HeaderValue {
    HeaderValue::try_from(format!("bytes={offset}-")).unwrap_or_else(|_| HeaderValue::from_static("bytes=0-"))
}

pub(crate) fn take<D>(slot: &Slot<D>) -> Option<RetryState<D>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Stands in for a consumer that already got its terminal callback.
pub(crate) struct Detached;

impl Handler for Detached {
    fn on_complete(&mut self, _trailers: HeaderList) {}

    fn on_error(&mut self, _error: ClientError) {}
}

/// Returns the value of a strong `ETag`.
fn strong_etag(head: &ResponseHead) -> Option<HeaderValue> {
    head.headers().get(header::ETAG.as_str()).filter(|v| v.as_bytes().starts_with(b"\"")).cloned()
}

/// First byte position of a `Content-Range: bytes first-last/len` value.
fn content_range_start(head: &ResponseHead) -> Option<u64> {
    let value = head.headers().get(header::CONTENT_RANGE.as_str())?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (first, _) = range.split_once('-')?;
    first.trim().parse().ok()
}

/// What the current attempt does with its response.
#[derive(Debug, Default)]
enum Delivery {
    /// Pass the response to the consumer
    #[default]
    Forward,
    /// Drop the body; the attempt ends with this error, retried per policy
    Retry(ClientError),
    /// Drop the body; the request ends with this error
    Fail(ClientError),
}

pub(crate) struct RetryHandler<D> {
    slot: Slot<D>,
    response_seen: bool,
    delivery: Delivery,
}

impl<D> RetryHandler<D>
where
    D: Dispatch + Send + Sync + 'static,
{
    pub(crate) fn new(slot: Slot<D>) -> Self {
        Self { slot, response_seen: false, delivery: Delivery::Forward }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RetryState<D>) -> R) -> Option<R> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(f)
    }

    /// Checks a response to a resumed or repeated request against what the consumer already has.
    fn verify(state: &RetryState<D>, head: &ResponseHead) -> Result<(), ClientError> {
        if state.delivered > 0 {
            if head.status() != StatusCode::PARTIAL_CONTENT {
                return Err(ClientError::retry_mismatch(format!("expected 206 but got {}", head.status())));
            }
            if content_range_start(head) != Some(state.delivered) {
                return Err(ClientError::retry_mismatch("content-range does not continue the delivered body"));
            }
            if strong_etag(head) != state.etag {
                return Err(ClientError::retry_mismatch("etag changed between attempts"));
            }
        } else if let Some(status) = state.delivered_status {
            if head.status() != status {
                return Err(ClientError::retry_mismatch(format!("status changed from {status} to {}", head.status())));
            }
        }
        Ok(())
    }
}

impl<D> Handler for RetryHandler<D>
where
    D: Dispatch + Send + Sync + 'static,
{
    fn on_connect(&mut self, abort: AbortHandle) {
        self.with_state(|state| {
            state.abort.attach(abort);
            if !state.connected {
                state.connected = true;
                state.consumer.on_connect(AbortHandle::shared(Arc::clone(&state.abort)));
            }
        });
    }

    fn on_headers(&mut self, head: &ResponseHead, resume: ResumeHandle) -> bool {
        self.response_seen = true;
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = guard.as_mut() else {
            return true;
        };
        state.resume.store(Some(Arc::new(resume)));

        let status = head.status().as_u16();
        if state.policy.is_retryable_status(status) {
            let retry_after = head.headers().get(header::RETRY_AFTER.as_str()).and_then(parse_retry_after);
            debug!(status, ?retry_after, "retryable response status");
            self.delivery = Delivery::Retry(ClientError::ResponseStatus { status, retry_after });
            return true;
        }

        if state.delivered_status.is_some() {
            if let Err(e) = Self::verify(state, head) {
                warn!(cause = %e, "retried response does not match");
                self.delivery = Delivery::Fail(e);
            }
            return true;
        }

        state.delivered_status = Some(head.status());
        state.etag = strong_etag(head);
        state.consumer.on_headers(head, ResumeHandle::shared(Arc::clone(&state.resume)))
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        if !matches!(self.delivery, Delivery::Forward) {
            return true;
        }
        self.with_state(|state| {
            state.delivered += chunk.len() as u64;
            state.consumer.on_data(chunk)
        })
        .unwrap_or(true)
    }

    fn on_complete(&mut self, trailers: HeaderList) {
        let Some(mut state) = take(&self.slot) else {
            return;
        };
        match std::mem::take(&mut self.delivery) {
            Delivery::Forward => state.consumer.on_complete(trailers),
            Delivery::Retry(error) => state.fail(error, self.response_seen),
            Delivery::Fail(error) => state.consumer.on_error(error),
        }
    }

    fn on_error(&mut self, error: ClientError) {
        let Some(mut state) = take(&self.slot) else {
            return;
        };
        match std::mem::take(&mut self.delivery) {
            Delivery::Fail(mismatch) => state.consumer.on_error(mismatch),
            Delivery::Forward | Delivery::Retry(_) => state.fail(error, self.response_seen),
        }
    }

    fn on_upgrade(&mut self, head: &ResponseHead, upgraded: Upgraded) {
        if let Some(mut state) = take(&self.slot) {
            state.consumer.on_upgrade(head, upgraded);
        }
    }
}
