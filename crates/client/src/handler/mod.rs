//! Consumer-facing callbacks of a dispatched request.
//!
//! A [`Handler`] observes one request from the moment it starts writing until
//! its single terminal callback:
//!
//! ```text
//! on_connect -> on_headers -> on_data* -> on_complete
//!                                      \-> on_error
//!                          \-> on_upgrade
//! ```
//!
//! `on_error` may replace any suffix of that sequence. Callbacks run on the
//! connection task and must not block. Returning `false` from `on_headers` or
//! `on_data` pauses delivery until the [`ResumeHandle`] is used.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::{Command, EntryId};
use crate::protocol::{ClientError, HeaderList, ResponseHead};

/// Callbacks for one dispatched request.
pub trait Handler: Send + 'static {
    /// The request started writing; `abort` cancels it from anywhere.
    fn on_connect(&mut self, abort: AbortHandle) {
        let _ = abort;
    }

    /// The final response head arrived. Return `false` to pause delivery.
    fn on_headers(&mut self, head: &ResponseHead, resume: ResumeHandle) -> bool {
        let _ = (head, resume);
        true
    }

    /// A piece of the response body. Return `false` to pause delivery.
    fn on_data(&mut self, chunk: Bytes) -> bool {
        let _ = chunk;
        true
    }

    /// The response completed, with the trailer fields of a chunked body.
    fn on_complete(&mut self, trailers: HeaderList);

    /// The request failed; no other callback follows.
    fn on_error(&mut self, error: ClientError);

    /// The server switched protocols; `upgraded` owns the socket from here on.
    fn on_upgrade(&mut self, head: &ResponseHead, upgraded: Upgraded) {
        drop(upgraded);
        self.on_error(ClientError::parse(format!("unhandled protocol switch, status {}", head.status())));
    }
}

/// Cancels a request.
///
/// Aborting before the request is written removes it quietly from the queue;
/// afterwards the connection is torn down. Aborting a finished request does nothing.
#[derive(Clone)]
pub struct AbortHandle {
    target: AbortTarget,
}

#[derive(Clone)]
enum AbortTarget {
    Entry { id: EntryId, aborted: Arc<AtomicBool>, commands: mpsc::UnboundedSender<Command> },
    Shared(Arc<SharedAbort>),
}

impl AbortHandle {
    pub(crate) fn entry(id: EntryId, aborted: Arc<AtomicBool>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { target: AbortTarget::Entry { id, aborted, commands } }
    }

    pub(crate) fn shared(shared: Arc<SharedAbort>) -> Self {
        Self { target: AbortTarget::Shared(shared) }
    }

    pub fn abort(&self) {
        self.abort_with_reason(None);
    }

    pub fn abort_with(&self, reason: impl Into<String>) {
        self.abort_with_reason(Some(reason.into()));
    }

    fn abort_with_reason(&self, reason: Option<String>) {
        match &self.target {
            AbortTarget::Entry { id, aborted, commands } => {
                if aborted.swap(true, Ordering::AcqRel) {
                    return;
                }
                trace!(id = id.get(), "abort requested");
                // a closed channel means the request is already resolved
                let _ = commands.send(Command::Abort { id: *id, reason });
            }
            AbortTarget::Shared(shared) => shared.abort(reason),
        }
    }

    pub fn is_aborted(&self) -> bool {
        match &self.target {
            AbortTarget::Entry { aborted, .. } => aborted.load(Ordering::Acquire),
            AbortTarget::Shared(shared) => shared.token.is_cancelled(),
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            AbortTarget::Entry { id, .. } => f.debug_struct("AbortHandle").field("id", id).finish(),
            AbortTarget::Shared(_) => f.debug_struct("AbortHandle").field("shared", &true).finish(),
        }
    }
}

/// Abort state shared by every attempt of a retried request.
#[derive(Default)]
pub(crate) struct SharedAbort {
    current: ArcSwapOption<AbortHandle>,
    reason: ArcSwapOption<String>,
    token: CancellationToken,
}

impl SharedAbort {
    /// Points the handle at the attempt now running; aborts it at once if cancellation already happened.
    pub(crate) fn attach(&self, handle: AbortHandle) {
        self.current.store(Some(Arc::new(handle.clone())));
        if self.token.is_cancelled() {
            handle.abort_with_reason(self.reason());
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.load_full().map(|r| r.as_ref().clone())
    }

    fn abort(&self, reason: Option<String>) {
        if self.token.is_cancelled() {
            return;
        }
        if let Some(reason) = &reason {
            self.reason.store(Some(Arc::new(reason.clone())));
        }
        self.token.cancel();
        if let Some(current) = self.current.load_full() {
            current.abort_with_reason(reason);
        }
    }
}

/// Resumes delivery after a handler returned `false`.
#[derive(Clone)]
pub struct ResumeHandle {
    target: ResumeTarget,
}

#[derive(Clone)]
enum ResumeTarget {
    Entry { id: EntryId, commands: mpsc::UnboundedSender<Command> },
    Shared(Arc<ArcSwapOption<ResumeHandle>>),
}

impl ResumeHandle {
    pub(crate) fn entry(id: EntryId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { target: ResumeTarget::Entry { id, commands } }
    }

    /// A handle that follows whichever attempt is stored in `current`.
    pub(crate) fn shared(current: Arc<ArcSwapOption<ResumeHandle>>) -> Self {
        Self { target: ResumeTarget::Shared(current) }
    }

    pub fn resume(&self) {
        match &self.target {
            ResumeTarget::Entry { id, commands } => {
                let _ = commands.send(Command::Resume { id: *id });
            }
            ResumeTarget::Shared(current) => {
                if let Some(handle) = current.load_full() {
                    handle.resume();
                }
            }
        }
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            ResumeTarget::Entry { id, .. } => f.debug_struct("ResumeHandle").field("id", id).finish(),
            ResumeTarget::Shared(_) => f.debug_struct("ResumeHandle").field("shared", &true).finish(),
        }
    }
}

/// Object-safe byte stream handed over after a protocol switch.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// The socket after a `101 Switching Protocols` or a successful `CONNECT`.
///
/// Reads return the bytes the server sent right after the response head first,
/// then continue on the socket.
pub struct Upgraded {
    io: Box<dyn Io>,
    remainder: Bytes,
}

impl Upgraded {
    pub(crate) fn new(io: Box<dyn Io>, remainder: Bytes) -> Self {
        Self { io, remainder }
    }

    /// Splits into the socket and the bytes already read from it.
    pub fn into_parts(self) -> (Box<dyn Io>, Bytes) {
        (self.io, self.remainder)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded").field("remainder", &self.remainder.len()).finish_non_exhaustive()
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remainder.has_remaining() {
            let len = this.remainder.len().min(buf.remaining());
            buf.put_slice(&this.remainder[..len]);
            this.remainder.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// A whole response collected by [`BufferedHandler`].
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
    pub trailers: HeaderList,
}

/// Handler that collects the response in memory and sends it through a oneshot channel.
#[derive(Debug)]
pub struct BufferedHandler {
    head: Option<ResponseHead>,
    body: BytesMut,
    tx: Option<oneshot::Sender<Result<BufferedResponse, ClientError>>>,
}

/// Creates a [`BufferedHandler`] and the receiver of its outcome.
pub fn buffered() -> (BufferedHandler, oneshot::Receiver<Result<BufferedResponse, ClientError>>) {
    let (tx, rx) = oneshot::channel();
    (BufferedHandler { head: None, body: BytesMut::new(), tx: Some(tx) }, rx)
}

impl BufferedHandler {
    fn finish(&mut self, result: Result<BufferedResponse, ClientError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Handler for BufferedHandler {
    fn on_headers(&mut self, head: &ResponseHead, _resume: ResumeHandle) -> bool {
        self.head = Some(head.clone());
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.body.extend_from_slice(&chunk);
        true
    }

    fn on_complete(&mut self, trailers: HeaderList) {
        let result = match self.head.take() {
            Some(head) => Ok(BufferedResponse { head, body: std::mem::take(&mut self.body).freeze(), trailers }),
            None => Err(ClientError::parse("response completed without a head")),
        };
        self.finish(result);
    }

    fn on_error(&mut self, error: ClientError) {
        self.finish(Err(error));
    }
}
