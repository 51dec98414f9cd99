use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FeedOutcome, RequestHead, ResponseParser};
use crate::config::ClientConfig;
use crate::connection::demux::{DemuxStep, Demultiplexer};
use crate::connection::message_writer::MessageWriter;
use crate::connection::phase::PipelinePolicy;
use crate::connection::queue::{RequestQueue, ResponseState, WriteState};
use crate::connection::{Command, ConnectionPhase, EntryId};
use crate::connection::client::Shared;
use crate::handler::{AbortHandle, Handler, Upgraded};
use crate::protocol::{BoxError, ClientError, Message, PayloadItem, RequestBody, RequestDescriptor, ResponseHead};

/// Connection state that exists before the socket does.
pub(crate) struct ConnectionCore {
    config: Arc<ClientConfig>,
    queue: RequestQueue,
    policy: PipelinePolicy,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    watchers: FuturesUnordered<BoxFuture<'static, Option<EntryId>>>,
    phase: ConnectionPhase,
    closing: bool,
}

impl ConnectionCore {
    pub(crate) fn new(
        config: ClientConfig,
        shared: Arc<Shared>,
        command_tx: mpsc::UnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let phase = shared.phase();
        Self {
            queue: RequestQueue::new(Arc::clone(&shared)),
            policy: PipelinePolicy::new(&config),
            config: Arc::new(config),
            shared,
            commands,
            command_tx,
            watchers: FuturesUnordered::new(),
            phase,
            closing: false,
        }
    }

    fn enqueue(&mut self, request: RequestDescriptor, handler: Box<dyn Handler>) {
        let signal = request.abort_signal().cloned();
        let id = self.queue.push(request, handler);
        trace!(id = %id, queued = self.queue.len(), "request queued");

        let (Some(signal), Some(entry)) = (signal, self.queue.get_mut(id)) else {
            return;
        };
        let resolved = entry.resolved_token().clone();
        self.watchers.push(Box::pin(async move {
            tokio::select! {
                () = signal.cancelled() => Some(id),
                () = resolved.cancelled() => None,
            }
        }));
    }

    /// Aborts a request that was not written yet; false if it already started.
    fn abort_unsent(&mut self, id: EntryId, reason: Option<String>) -> bool {
        match self.queue.remove_unsent(id) {
            Some(mut entry) => {
                debug!(id = %id, "request aborted before it was written");
                entry.fail(ClientError::Aborted { reason });
                true
            }
            None => false,
        }
    }

    fn publish(&mut self, phase: ConnectionPhase) {
        if phase != self.phase {
            debug!(from = %self.phase, to = %phase, "connection phase changed");
            self.phase = phase;
        }
        self.shared.set_phase(phase);
        self.shared.set_depth(self.policy.depth());
    }

    /// Waits for the socket while queueing requests.
    async fn connect<F, IO>(&mut self, connector: F) -> Option<IO>
    where
        F: Future<Output = io::Result<IO>>,
    {
        tokio::pin!(connector);
        loop {
            tokio::select! {
                biased;
                result = &mut connector => {
                    return match result {
                        Ok(io) => Some(io),
                        Err(e) => {
                            error!(cause = %e, "failed to connect");
                            // requests dispatched before the failure share its cause
                            while let Ok(command) = self.commands.try_recv() {
                                match command {
                                    Command::Dispatch { request, handler } => self.enqueue(request, handler),
                                    Command::Abort { id, reason } => {
                                        self.abort_unsent(id, reason);
                                    }
                                    Command::Resume { .. } | Command::Close | Command::Destroy(_) => {}
                                }
                            }
                            self.finish(&ClientError::socket(&e));
                            None
                        }
                    };
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Dispatch { request, handler } => self.enqueue(request, handler),
                    Command::Abort { id, reason } => {
                        self.abort_unsent(id, reason);
                    }
                    Command::Resume { .. } => {}
                    Command::Close => {
                        self.closing = true;
                        self.publish(ConnectionPhase::Draining);
                    }
                    Command::Destroy(error) => {
                        self.finish(&error);
                        return None;
                    }
                },
                Some(Some(id)) = self.watchers.next(), if !self.watchers.is_empty() => {
                    self.abort_unsent(id, None);
                }
            }
        }
    }

    /// Resolves everything still pending with `error` and marks the connection closed.
    fn finish(&mut self, error: &ClientError) {
        self.publish(ConnectionPhase::Closed);
        self.queue.drain_all(error);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Dispatch { mut handler, .. } = command {
                self.shared.release();
                handler.on_error(ClientError::Closed);
            }
        }

        self.shared.closed_token().cancel();
        info!("connection closed");
    }
}

/// Entry point of the connection task.
pub(crate) async fn run<F, IO>(connector: F, mut core: ConnectionCore)
where
    F: Future<Output = io::Result<IO>>,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Some(io) = core.connect(connector).await else {
        return;
    };
    info!("connection established");
    HttpConnection::new(io, core).run().await;
}

/// Why the connection stops.
#[derive(Debug)]
enum Stop {
    /// Nothing left to do; unwritten requests get `Closed`
    Done,
    /// The server closed the socket with requests pending
    PeerClosed,
    /// Every pending request fails with the error
    Fatal(ClientError),
    /// Writing one request failed; the others get `Closed`
    Request { id: EntryId, error: ClientError },
    /// A started request was aborted; the others get `ConnectionAborted`
    Abort { id: EntryId, reason: Option<String> },
    /// The head request took over the socket
    Upgrade { head: ResponseHead, remainder: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    KeepAlive,
    Headers,
    Body,
}

/// The single timer of a connection, re-armed whenever what it guards changes.
#[derive(Debug)]
struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: Option<(TimerKind, Option<EntryId>)>,
    duration: Duration,
}

impl Timer {
    fn new() -> Self {
        Self { sleep: Box::pin(tokio::time::sleep(Duration::ZERO)), armed: None, duration: Duration::ZERO }
    }

    fn set(&mut self, target: Option<(TimerKind, Option<EntryId>, Duration)>, restart: bool) {
        let Some((kind, id, duration)) = target else {
            self.armed = None;
            return;
        };
        if restart || self.armed != Some((kind, id)) {
            trace!(kind = ?kind, timeout = ?duration, "timer armed");
            self.armed = Some((kind, id));
            self.duration = duration;
            self.sleep.as_mut().reset(Instant::now() + duration);
        }
    }
}

/// A request body being streamed to the socket.
struct BodyWrite {
    id: EntryId,
    body: UnsyncBoxBody<Bytes, BoxError>,
}

async fn next_frame(body: &mut Option<BodyWrite>) -> Option<Result<Frame<Bytes>, BoxError>> {
    match body {
        Some(write) => write.body.frame().await,
        None => std::future::pending().await,
    }
}

/// The connection task once the socket is available.
///
/// One loop multiplexes client commands, abort signals, socket writes,
/// request body polling, socket reads and the timer. Everything the
/// connection owns is only touched from here.
pub(crate) struct HttpConnection<IO> {
    reader: ReadHalf<IO>,
    writer: MessageWriter<WriteHalf<IO>>,
    parser: ResponseParser,
    demux: Demultiplexer,
    core: ConnectionCore,
    body: Option<BodyWrite>,
    timer: Timer,
    read_eof: bool,
    eof_fed: bool,
    progress: bool,
}

impl<IO> HttpConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(io: IO, core: ConnectionCore) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let config = &core.config;
        Self {
            reader,
            writer: MessageWriter::with_capacity(writer, config.write_high_water_mark.min(64 * 1024)),
            parser: ResponseParser::new(config.max_header_size, config.read_buffer_size),
            demux: Demultiplexer::new(config.max_response_size, core.command_tx.clone()),
            core,
            body: None,
            timer: Timer::new(),
            read_eof: false,
            eof_fed: false,
            progress: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let stop = loop {
            if let Err(stop) = self.step().await {
                break stop;
            }
        };
        self.shutdown(stop).await;
    }

    async fn step(&mut self) -> Result<(), Stop> {
        self.advance_writes()?;
        self.check_drained()?;
        self.publish_phase();
        self.rearm_timer();

        let want_read = !self.read_eof && !self.demux.is_paused() && !self.demux.has_pending();
        let want_write = self.writer.has_pending();
        let want_body = self.body.is_some() && self.writer.buffered() < self.core.config.write_high_water_mark;
        let timer_armed = self.timer.armed.is_some();
        if want_read {
            self.parser.buffer_mut().reserve(self.core.config.read_buffer_size);
        }

        tokio::select! {
            biased;
            Some(command) = self.core.commands.recv() => self.handle_command(command),
            Some(Some(id)) = self.core.watchers.next(), if !self.core.watchers.is_empty() => self.abort(id, None),
            result = self.writer.write_some(), if want_write => result.map_err(|e| Stop::Fatal(e.into())),
            frame = next_frame(&mut self.body), if want_body => self.on_body_frame(frame),
            result = self.reader.read_buf(self.parser.buffer_mut()), if want_read => self.on_read(result),
            () = self.timer.sleep.as_mut(), if timer_armed => self.on_timeout(),
            else => Err(Stop::Done),
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<(), Stop> {
        match command {
            Command::Dispatch { request, handler } => {
                self.core.enqueue(request, handler);
                Ok(())
            }
            Command::Abort { id, reason } => self.abort(id, reason),
            Command::Resume { id } => {
                if self.demux.resume(id, &self.core.queue) {
                    self.pump()
                } else {
                    Ok(())
                }
            }
            Command::Close => {
                self.core.closing = true;
                Ok(())
            }
            Command::Destroy(error) => Err(Stop::Fatal(error)),
        }
    }

    fn abort(&mut self, id: EntryId, reason: Option<String>) -> Result<(), Stop> {
        if self.core.abort_unsent(id, reason.clone()) {
            return Ok(());
        }
        match self.core.queue.get_mut(id) {
            Some(entry) if !entry.is_resolved() => {
                entry.mark_aborted();
                warn!(id = %id, "request aborted while in flight, closing connection");
                Err(Stop::Abort { id, reason })
            }
            _ => {
                trace!(id = %id, "stale abort ignored");
                Ok(())
            }
        }
    }

    /// Serializes every request that may be written now.
    fn advance_writes(&mut self) -> Result<(), Stop> {
        loop {
            if !self.core.policy.is_reusable() || self.body.is_some() {
                return Ok(());
            }
            if self.writer.buffered() >= self.core.config.write_high_water_mark {
                return Ok(());
            }

            let running = self.core.queue.running();
            if running >= self.core.policy.depth() || self.core.queue.has_running_exclusive() {
                return Ok(());
            }

            let Some(entry) = self.core.queue.next_unsent() else {
                return Ok(());
            };
            if entry.is_exclusive() && running > 0 {
                return Ok(());
            }

            let id = entry.id();
            self.start_request(id)?;
        }
    }

    fn start_request(&mut self, id: EntryId) -> Result<(), Stop> {
        let last = self.core.queue.is_last_unsent(id);
        let Some(entry) = self.core.queue.get_mut(id) else {
            return Ok(());
        };

        let abort = AbortHandle::entry(id, Arc::clone(entry.abort_flag()), self.core.command_tx.clone());
        if let Some(handler) = entry.handler_mut() {
            handler.on_connect(abort);
        }
        if entry.is_abort_requested() {
            // the queued abort command removes it
            return Ok(());
        }

        let request = entry.request_mut();
        let body = request.take_body();
        let payload_size = body.payload_size(request.method());
        let keep_alive = !request.wants_close() && !(self.core.closing && last);

        let head = RequestHead {
            method: request.method(),
            path: request.path(),
            headers: request.headers(),
            host: self.core.config.authority.as_ref(),
            keep_alive,
            upgrade: request.upgrade_protocol(),
        };
        self.writer.write::<Bytes>(Message::Header((head, payload_size))).map_err(|e| Stop::Request { id, error: e.into() })?;
        self.parser.expect_response(request.method().clone(), request.upgrade_protocol().is_some());
        debug!(id = %id, method = %request.method(), path = request.path(), ?payload_size, "request head written");

        if !keep_alive {
            self.core.policy.stop_reuse();
        }

        let state = if !self.writer.is_body_pending() {
            WriteState::Sent
        } else {
            match body {
                RequestBody::Empty => {
                    self.writer.write::<Bytes>(Message::Payload(PayloadItem::Eof)).map_err(|e| Stop::Request { id, error: e.into() })?;
                    WriteState::Sent
                }
                RequestBody::Full(bytes) => {
                    if !bytes.is_empty() {
                        self.writer.write(Message::Payload(PayloadItem::Chunk(bytes))).map_err(|e| Stop::Request { id, error: e.into() })?;
                    }
                    self.writer.write::<Bytes>(Message::Payload(PayloadItem::Eof)).map_err(|e| Stop::Request { id, error: e.into() })?;
                    WriteState::Sent
                }
                RequestBody::Stream { body, .. } => {
                    self.body = Some(BodyWrite { id, body });
                    WriteState::HeadersSent
                }
            }
        };
        entry.set_write_state(state);
        Ok(())
    }

    fn on_body_frame(&mut self, frame: Option<Result<Frame<Bytes>, BoxError>>) -> Result<(), Stop> {
        let Some(id) = self.body.as_ref().map(|write| write.id) else {
            return Ok(());
        };

        let state = match frame {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if data.is_empty() => return Ok(()),
                Ok(data) => {
                    trace!(id = %id, len = data.len(), "request body chunk");
                    self.writer.write(Message::Payload(PayloadItem::Chunk(data))).map_err(|e| Stop::Request { id, error: e.into() })?;
                    WriteState::BodySending
                }
                // request trailers are not sent
                Err(_) => return Ok(()),
            },
            Some(Err(e)) => {
                warn!(id = %id, cause = %e, "request body failed");
                return Err(Stop::Request { id, error: ClientError::request_body(e) });
            }
            None => {
                self.body = None;
                self.writer.write::<Bytes>(Message::Payload(PayloadItem::Eof)).map_err(|e| Stop::Request { id, error: e.into() })?;
                WriteState::Sent
            }
        };

        if let Some(entry) = self.core.queue.get_mut(id) {
            entry.set_write_state(state);
        }
        Ok(())
    }

    fn on_read(&mut self, result: io::Result<usize>) -> Result<(), Stop> {
        match result {
            Ok(0) => {
                debug!(pending = self.core.queue.len(), "server closed the connection");
                self.read_eof = true;
                self.pump()
            }
            Ok(n) => {
                trace!(n, "response bytes read");
                self.progress = true;
                self.pump()
            }
            Err(e) => {
                error!(cause = %e, "failed to read from socket");
                Err(Stop::Fatal(ClientError::socket(&e)))
            }
        }
    }

    /// Delivers parsed events and parses buffered bytes until either runs out or delivery pauses.
    fn pump(&mut self) -> Result<(), Stop> {
        loop {
            match self.demux.process(&mut self.core.queue, &mut self.core.policy) {
                DemuxStep::Drained => {}
                DemuxStep::Paused | DemuxStep::Aborted(_) => return Ok(()),
                DemuxStep::Upgrade { head, remainder } => return Err(Stop::Upgrade { head, remainder }),
                DemuxStep::Fatal(e) => return Err(Stop::Fatal(e)),
            }

            let outcome = if self.read_eof && !self.eof_fed {
                self.eof_fed = true;
                self.parser.feed_eof(self.demux.events_mut())
            } else {
                self.parser.advance(self.demux.events_mut())
            };

            match outcome {
                FeedOutcome::ConsumedAll if !self.demux.has_pending() => break,
                FeedOutcome::ConsumedAll | FeedOutcome::PausedForUpgrade => {}
                FeedOutcome::Error(e) => {
                    // complete responses parsed before the failure are still delivered
                    if let DemuxStep::Upgrade { head, remainder } = self.demux.process(&mut self.core.queue, &mut self.core.policy) {
                        return Err(Stop::Upgrade { head, remainder });
                    }
                    return Err(Stop::Fatal(e.into()));
                }
            }
        }

        if self.eof_fed {
            if self.core.queue.is_empty() {
                return Err(Stop::Done);
            }
            return Err(Stop::PeerClosed);
        }
        Ok(())
    }

    fn on_timeout(&mut self) -> Result<(), Stop> {
        let Some((kind, _)) = self.timer.armed.take() else {
            return Ok(());
        };
        let duration = self.timer.duration;
        match kind {
            TimerKind::KeepAlive => {
                debug!(timeout = ?duration, "keep-alive timeout, closing idle connection");
                Err(Stop::Done)
            }
            TimerKind::Headers => {
                warn!(timeout = ?duration, "response headers timeout");
                Err(Stop::Fatal(ClientError::HeadersTimeout(duration)))
            }
            TimerKind::Body => {
                warn!(timeout = ?duration, "response body timeout");
                Err(Stop::Fatal(ClientError::BodyTimeout(duration)))
            }
        }
    }

    /// Stops once nothing is in flight and the connection may not take more requests.
    fn check_drained(&self) -> Result<(), Stop> {
        if self.core.queue.running() > 0 || self.body.is_some() || self.demux.has_pending() {
            return Ok(());
        }
        if !self.core.policy.is_reusable() || (self.core.closing && self.core.queue.is_empty()) {
            return Err(Stop::Done);
        }
        Ok(())
    }

    fn publish_phase(&mut self) {
        let phase = if self.core.closing || !self.core.policy.is_reusable() {
            ConnectionPhase::Draining
        } else if self.core.queue.is_empty() {
            ConnectionPhase::Idle
        } else {
            ConnectionPhase::Active
        };
        self.core.publish(phase);
    }

    fn rearm_timer(&mut self) {
        let progress = std::mem::take(&mut self.progress);
        let config = &self.core.config;

        let target = if self.core.queue.is_empty() && !self.core.closing {
            Some((TimerKind::KeepAlive, None, self.core.policy.keep_alive_timeout()))
        } else if self.demux.is_paused() {
            None
        } else {
            self.core.queue.peek_head().filter(|e| e.write_state() == WriteState::Sent || e.response_state() != ResponseState::Awaiting).and_then(|head| {
                match head.response_state() {
                    ResponseState::Awaiting => config.headers_timeout.map(|d| (TimerKind::Headers, Some(head.id()), d)),
                    ResponseState::HeadersReceived | ResponseState::BodyStreaming => {
                        config.body_timeout.map(|d| (TimerKind::Body, Some(head.id()), d))
                    }
                    ResponseState::Done => None,
                }
            })
        };

        let restart = progress && matches!(target, Some((TimerKind::Body, ..)));
        self.timer.set(target, restart);
    }

    async fn shutdown(mut self, stop: Stop) {
        match stop {
            Stop::Done => {
                if let Err(e) = self.writer.shutdown().await {
                    debug!(cause = %e, "failed to shut down socket");
                }
                self.core.finish(&ClientError::Closed);
            }
            Stop::PeerClosed => {
                self.core.queue.drain_with(|entry| if entry.is_sent() { ClientError::UnexpectedEof } else { ClientError::Closed });
                self.core.finish(&ClientError::Closed);
            }
            Stop::Fatal(error) => {
                error!(cause = %error, pending = self.core.queue.len(), "connection failed");
                self.core.finish(&error);
            }
            Stop::Request { id, error } => {
                error!(id = %id, cause = %error, "failed to write request");
                self.core.queue.drain_with(|entry| if entry.id() == id { error.clone() } else { ClientError::Closed });
                self.core.finish(&ClientError::Closed);
            }
            Stop::Abort { id, reason } => {
                self.core.queue.drain_with(|entry| {
                    if entry.id() == id { ClientError::Aborted { reason: reason.clone() } } else { ClientError::ConnectionAborted }
                });
                self.core.finish(&ClientError::ConnectionAborted);
            }
            Stop::Upgrade { head, remainder } => self.upgrade(head, remainder).await,
        }
    }

    async fn upgrade(self, head: ResponseHead, remainder: Bytes) {
        let Self { reader, mut writer, mut core, .. } = self;
        if let Err(e) = writer.flush().await {
            warn!(cause = %e, "failed to flush before protocol switch");
        }

        let io = reader.unsplit(writer.into_inner());
        if let Some(entry) = core.queue.peek_head_mut() {
            info!(id = %entry.id(), status = %head.status(), remainder = remainder.len(), "protocol switched");
            entry.set_response_state(ResponseState::Done);
            entry.upgrade(&head, Upgraded::new(Box::new(io), remainder));
        }
        core.queue.pop_head();
        core.finish(&ClientError::Closed);
    }
}
