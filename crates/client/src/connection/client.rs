use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::http_connection::{self, ConnectionCore};
use crate::connection::{Command, ConnectionPhase};
use crate::dispatch::{Dispatch, DispatchError, Rejection};
use crate::handler::Handler;
use crate::protocol::{ClientError, RequestDescriptor};

/// State the connection task publishes for the synchronous admission check.
#[derive(Debug)]
pub(crate) struct Shared {
    phase: AtomicU8,
    depth: AtomicUsize,
    in_flight: AtomicUsize,
    closed: CancellationToken,
}

impl Shared {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            phase: AtomicU8::new(ConnectionPhase::Idle as u8),
            depth: AtomicUsize::new(depth),
            in_flight: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ConnectionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::Release);
    }

    /// Requests accepted and not resolved yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let _ = self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

/// Handle to one HTTP/1.1 connection.
///
/// The connection runs on its own task. `Client` is cheap to clone; when the
/// last clone is dropped the connection finishes its queued requests and closes.
///
/// ```no_run
/// use micro_client::handler::buffered;
/// use micro_client::protocol::RequestDescriptor;
/// use micro_client::{Client, ClientConfig, Dispatch};
/// use tokio::net::TcpStream;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::connect(TcpStream::connect("127.0.0.1:8080"), ClientConfig::default().authority("127.0.0.1:8080"));
///
/// let (handler, response) = buffered();
/// client.dispatch(RequestDescriptor::get("/"), Box::new(handler))?;
/// let response = response.await??;
/// println!("{} {:?}", response.head.status(), response.body);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Client {
    /// Starts a connection on an already connected socket.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<IO>(io: IO, config: ClientConfig) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(std::future::ready(Ok(io)), config, ConnectionPhase::Idle)
    }

    /// Starts a connection whose socket is produced by `connector`.
    ///
    /// Requests dispatched while connecting are queued. If the connector
    /// fails, each of them gets a `ClientError::Socket`.
    pub fn connect<F, IO>(connector: F, config: ClientConfig) -> Self
    where
        F: Future<Output = io::Result<IO>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(connector, config, ConnectionPhase::Connecting)
    }

    fn spawn<F, IO>(connector: F, config: ClientConfig, phase: ConnectionPhase) -> Self
    where
        F: Future<Output = io::Result<IO>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new(config.pipelining));
        shared.set_phase(phase);

        let (tx, rx) = mpsc::unbounded_channel();
        let core = ConnectionCore::new(config, Arc::clone(&shared), tx.clone(), rx);
        tokio::spawn(http_connection::run(connector, core));

        Self { inner: Arc::new(ClientInner { commands: tx, shared }) }
    }

    /// Stops accepting requests, finishes the queued ones, then closes the socket.
    pub fn close(&self) {
        debug!("close requested");
        let _ = self.inner.commands.send(Command::Close);
    }

    /// Fails every queued request with `error` and closes the socket at once.
    pub fn destroy(&self, error: ClientError) {
        debug!(cause = %error, "destroy requested");
        let _ = self.inner.commands.send(Command::Destroy(error));
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.shared.phase()
    }

    /// Current pipelining depth; drops to 1 once the server disallows pipelining.
    pub fn pipelining(&self) -> usize {
        self.inner.shared.depth()
    }

    /// Requests accepted and not resolved yet.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.in_flight()
    }

    /// Waits until the connection task has finished.
    pub async fn closed(&self) {
        self.inner.shared.closed_token().cancelled().await;
    }
}

impl Dispatch for Client {
    fn dispatch(&self, mut request: RequestDescriptor, handler: Box<dyn Handler>) -> Result<(), DispatchError> {
        if let Err(e) = request.validate() {
            return Err(DispatchError::new(Rejection::InvalidArgument(e), handler));
        }
        request.apply_declared_length();

        let shared = &self.inner.shared;
        let phase = shared.phase();
        if !phase.is_accepting() {
            let reason = if phase == ConnectionPhase::Draining { Rejection::Draining } else { Rejection::Closed };
            return Err(DispatchError::new(reason, handler));
        }

        if request.request_body().is_unknown_length() && shared.in_flight() >= shared.depth() {
            return Err(DispatchError::new(Rejection::Busy, handler));
        }

        trace!(method = %request.method(), path = request.path(), "dispatch");
        shared.acquire();
        if let Err(mpsc::error::SendError(command)) = self.inner.commands.send(Command::Dispatch { request, handler }) {
            shared.release();
            if let Command::Dispatch { handler, .. } = command {
                return Err(DispatchError::new(Rejection::Closed, handler));
            }
        }
        Ok(())
    }
}
