//! Ordered queue of the requests bound to one connection.
//!
//! Entries are appended in dispatch order and leave from the head once their
//! response is complete. Responses arrive in write order, so the head entry is
//! always the one the next response belongs to.
//!
//! A [`QueueEntry`] holds its handler as an `Option` that is taken by the
//! terminal callback. Whatever path resolves an entry, a second resolution
//! finds the handler gone and delivers nothing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::client::Shared;
use crate::handler::{Handler, Upgraded};
use crate::protocol::{ClientError, HeaderList, RequestDescriptor, ResponseHead};

/// Monotonic sequence number of a queue entry, unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How far the request has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    NotSent,
    HeadersSent,
    BodySending,
    Sent,
}

/// How far the response has been received; only advances for the head entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Awaiting,
    HeadersReceived,
    BodyStreaming,
    Done,
}

pub struct QueueEntry {
    id: EntryId,
    request: RequestDescriptor,
    handler: Option<Box<dyn Handler>>,
    write_state: WriteState,
    response_state: ResponseState,
    exclusive: bool,
    aborted: Arc<AtomicBool>,
    resolved: CancellationToken,
    shared: Arc<Shared>,
}

impl QueueEntry {
    fn new(id: EntryId, request: RequestDescriptor, handler: Box<dyn Handler>, shared: Arc<Shared>) -> Self {
        let exclusive = request.request_body().is_stream() || !request.is_idempotent() || request.is_upgrade();
        Self {
            id,
            request,
            handler: Some(handler),
            write_state: WriteState::NotSent,
            response_state: ResponseState::Awaiting,
            exclusive,
            aborted: Arc::new(AtomicBool::new(false)),
            resolved: CancellationToken::new(),
            shared,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut RequestDescriptor {
        &mut self.request
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub(crate) fn set_write_state(&mut self, state: WriteState) {
        self.write_state = state;
    }

    pub fn response_state(&self) -> ResponseState {
        self.response_state
    }

    pub(crate) fn set_response_state(&mut self, state: ResponseState) {
        self.response_state = state;
    }

    pub fn is_sent(&self) -> bool {
        self.write_state != WriteState::NotSent
    }

    /// Returns true if nothing else may be in flight while this request is.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Returns true once the terminal callback was delivered.
    pub fn is_resolved(&self) -> bool {
        self.handler.is_none()
    }

    pub(crate) fn abort_flag(&self) -> &Arc<AtomicBool> {
        &self.aborted
    }

    pub fn is_abort_requested(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Cancelled when the entry resolves; ends any watcher of the request signal.
    pub(crate) fn resolved_token(&self) -> &CancellationToken {
        &self.resolved
    }

    pub(crate) fn handler_mut(&mut self) -> Option<&mut (dyn Handler + 'static)> {
        self.handler.as_deref_mut()
    }

    pub(crate) fn complete(&mut self, trailers: HeaderList) {
        if let Some(mut handler) = self.take_handler() {
            trace!(id = %self.id, "request complete");
            handler.on_complete(trailers);
        }
    }

    pub(crate) fn fail(&mut self, error: ClientError) {
        if let Some(mut handler) = self.take_handler() {
            trace!(id = %self.id, cause = %error, "request failed");
            handler.on_error(error);
        }
    }

    pub(crate) fn upgrade(&mut self, head: &ResponseHead, upgraded: Upgraded) {
        if let Some(mut handler) = self.take_handler() {
            trace!(id = %self.id, status = %head.status(), "request upgraded");
            handler.on_upgrade(head, upgraded);
        }
    }

    fn take_handler(&mut self) -> Option<Box<dyn Handler>> {
        let handler = self.handler.take()?;
        self.resolved.cancel();
        self.shared.release();
        Some(handler)
    }
}

impl Drop for QueueEntry {
    fn drop(&mut self) {
        self.fail(ClientError::Closed);
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("write_state", &self.write_state)
            .field("response_state", &self.response_state)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Requests of one connection in dispatch order.
#[derive(Debug)]
pub struct RequestQueue {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
    shared: Arc<Shared>,
}

impl RequestQueue {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { entries: VecDeque::new(), next_id: 0, shared }
    }

    /// Appends a request, returning its id.
    pub(crate) fn push(&mut self, request: RequestDescriptor, handler: Box<dyn Handler>) -> EntryId {
        let id = EntryId::new(self.next_id);
        self.next_id += 1;
        self.entries.push_back(QueueEntry::new(id, request, handler, Arc::clone(&self.shared)));
        id
    }

    pub fn peek_head(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub(crate) fn peek_head_mut(&mut self) -> Option<&mut QueueEntry> {
        self.entries.front_mut()
    }

    /// Removes the head entry once its response is done.
    pub(crate) fn pop_head(&mut self) -> Option<QueueEntry> {
        let head = self.entries.front()?;
        assert_eq!(head.response_state, ResponseState::Done, "head entry {} popped before its response completed", head.id);
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Resolves every entry in queue order with `error` and empties the queue.
    pub(crate) fn drain_all(&mut self, error: &ClientError) {
        self.drain_with(|_| error.clone());
    }

    /// Resolves every entry in queue order with the error chosen per entry.
    pub(crate) fn drain_with<F>(&mut self, mut error_of: F)
    where
        F: FnMut(&QueueEntry) -> ClientError,
    {
        while let Some(mut entry) = self.entries.pop_front() {
            let error = error_of(&entry);
            entry.fail(error);
        }
    }

    /// First entry not written yet, skipping entries with an abort on its way.
    pub(crate) fn next_unsent(&mut self) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.write_state == WriteState::NotSent && !e.is_abort_requested())
    }

    /// Returns true if `id` is the only entry left to write.
    pub(crate) fn is_last_unsent(&self, id: EntryId) -> bool {
        let mut unsent = self.entries.iter().filter(|e| e.write_state == WriteState::NotSent);
        unsent.next().is_some_and(|e| e.id == id) && unsent.next().is_none()
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Removes an entry that was not written yet; `None` if it is unknown or already writing.
    pub(crate) fn remove_unsent(&mut self, id: EntryId) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.id == id && e.write_state == WriteState::NotSent)?;
        self.entries.remove(index)
    }

    /// Entries written, at least partly, whose response is not done.
    pub fn running(&self) -> usize {
        self.entries.iter().filter(|e| e.is_sent() && e.response_state != ResponseState::Done).count()
    }

    /// Returns true if a written request that forbids pipelining is still waiting for its response.
    pub fn has_running_exclusive(&self) -> bool {
        self.entries.iter().any(|e| e.is_sent() && e.exclusive && e.response_state != ResponseState::Done)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Handler that records every callback as a line of text.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct Recorder {
        pub(crate) log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    impl Recorder {
        pub(crate) fn named(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Handler> {
            Box::new(Self { log: Arc::clone(log), name })
        }

        fn push(&self, line: String) {
            self.log.lock().unwrap().push(format!("{}:{line}", self.name));
        }
    }

    impl Handler for Recorder {
        fn on_complete(&mut self, _trailers: HeaderList) {
            self.push("complete".into());
        }

        fn on_error(&mut self, error: ClientError) {
            self.push(format!("error {error}"));
        }
    }

    fn queue() -> (RequestQueue, Arc<Shared>, Arc<Mutex<Vec<String>>>) {
        let shared = Arc::new(Shared::new(1));
        (RequestQueue::new(Arc::clone(&shared)), shared, Arc::default())
    }

    #[test]
    fn ids_are_monotonic() {
        let (mut queue, _, log) = queue();
        let a = queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        let b = queue.push(RequestDescriptor::get("/b"), Recorder::named("b", &log));
        assert!(a < b);
        assert_eq!(queue.peek_head().unwrap().id(), a);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_all_resolves_in_order_once() {
        let (mut queue, shared, log) = queue();
        shared.acquire();
        shared.acquire();
        queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        queue.push(RequestDescriptor::get("/b"), Recorder::named("b", &log));
        queue.peek_head_mut().unwrap().set_write_state(WriteState::Sent);

        queue.drain_all(&ClientError::UnexpectedEof);
        queue.drain_all(&ClientError::Closed);

        let log = log.lock().unwrap();
        assert_eq!(*log, ["a:error other side closed the connection in the middle of a message", "b:error other side closed the connection in the middle of a message"]);
        assert!(queue.is_empty());
        assert_eq!(shared.in_flight(), 0);
    }

    #[test]
    fn remove_unsent_only() {
        let (mut queue, _, log) = queue();
        let a = queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        let b = queue.push(RequestDescriptor::get("/b"), Recorder::named("b", &log));
        queue.get_mut(a).unwrap().set_write_state(WriteState::Sent);

        assert!(queue.remove_unsent(a).is_none());
        let mut removed = queue.remove_unsent(b).unwrap();
        removed.fail(ClientError::aborted());
        assert!(queue.remove_unsent(b).is_none());

        assert_eq!(queue.running(), 1);
        assert_eq!(queue.next_unsent().map(|e| e.id()), None);
        assert_eq!(*log.lock().unwrap(), ["b:error request aborted"]);
    }

    #[test]
    fn exclusive_requests() {
        let (mut queue, _, log) = queue();
        queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        queue.push(RequestDescriptor::post("/b"), Recorder::named("b", &log));
        queue.push(RequestDescriptor::get("/c").upgrade("websocket"), Recorder::named("c", &log));

        let exclusive: Vec<_> = queue.iter().map(QueueEntry::is_exclusive).collect();
        assert_eq!(exclusive, [false, true, true]);
        assert!(!queue.has_running_exclusive());
    }

    #[test]
    #[should_panic(expected = "popped before its response completed")]
    fn pop_head_requires_done() {
        let (mut queue, _, log) = queue();
        queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        queue.pop_head();
    }

    #[test]
    fn dropped_entry_is_resolved() {
        let (mut queue, _, log) = queue();
        queue.push(RequestDescriptor::get("/a"), Recorder::named("a", &log));
        drop(queue);
        assert_eq!(*log.lock().unwrap(), ["a:error connection closed before the request completed"]);
    }
}
