//! Routes parser events to the handler at the head of the queue.
//!
//! Responses arrive in the order requests were written, so every event
//! belongs to [`RequestQueue::peek_head`]. Interim `1xx` responses are
//! swallowed. A handler returning `false` stops delivery until its
//! [`ResumeHandle`] fires; undelivered events stay queued here and the
//! connection stops reading from the socket meanwhile.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::phase::PipelinePolicy;
use crate::connection::queue::{RequestQueue, ResponseState};
use crate::connection::{Command, EntryId};
use crate::handler::ResumeHandle;
use crate::protocol::{ClientError, HeaderList, ParseError, ParserEvent, ResponseHead};

/// Why [`Demultiplexer::process`] returned.
#[derive(Debug)]
pub(crate) enum DemuxStep {
    /// Every queued event was delivered
    Drained,
    /// A handler paused delivery
    Paused,
    /// A handler aborted its request from inside a callback
    Aborted(EntryId),
    /// The head request switched protocols
    Upgrade { head: ResponseHead, remainder: Bytes },
    /// The connection can't continue
    Fatal(ClientError),
}

/// State of the response currently being delivered.
#[derive(Debug, Default)]
struct InProgress {
    informational: bool,
    until_close: bool,
    discarding: bool,
    received: usize,
    trailers: HeaderList,
    upgrade: Option<ResponseHead>,
}

#[derive(Debug)]
pub(crate) struct Demultiplexer {
    events: VecDeque<ParserEvent>,
    current: Option<InProgress>,
    paused: bool,
    max_response_size: Option<usize>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Demultiplexer {
    pub(crate) fn new(max_response_size: Option<usize>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { events: VecDeque::new(), current: None, paused: false, max_response_size, commands }
    }

    /// Queue the parser appends to.
    pub(crate) fn events_mut(&mut self) -> &mut VecDeque<ParserEvent> {
        &mut self.events
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.events.is_empty()
    }

    /// Body bytes of the current response parsed but not delivered yet.
    fn pending_body_bytes(&self) -> usize {
        self.events
            .iter()
            .take_while(|event| !matches!(event, ParserEvent::MessageComplete | ParserEvent::MessageBegin))
            .map(ParserEvent::data_len)
            .sum()
    }

    /// Applies the response size limit to body bytes held back by a paused handler.
    ///
    /// Over the limit, the head entry fails and the pause is lifted so the rest
    /// of its body is discarded. A close-delimited body fails the connection.
    fn check_held_back(&mut self, queue: &mut RequestQueue) -> Option<DemuxStep> {
        let max_size = self.max_response_size?;
        let held = self.pending_body_bytes();
        let current = self.current.as_mut()?;
        if current.discarding || current.received + held <= max_size {
            return None;
        }
        if current.until_close {
            return Some(DemuxStep::Fatal(ClientError::ResponseTooLarge { max_size }));
        }

        let entry = queue.peek_head_mut()?;
        warn!(id = %entry.id(), max_size, held, "paused response body too large, discarding the rest");
        current.discarding = true;
        entry.fail(ClientError::ResponseTooLarge { max_size });
        self.paused = false;
        None
    }

    /// Lifts a pause set by the head entry; returns false for any other id.
    pub(crate) fn resume(&mut self, id: EntryId, queue: &RequestQueue) -> bool {
        if !self.paused || queue.peek_head().map(|e| e.id()) != Some(id) {
            trace!(id = %id, "stale resume ignored");
            return false;
        }
        trace!(id = %id, "delivery resumed");
        self.paused = false;
        true
    }

    /// Delivers queued events until they run out or delivery has to stop.
    pub(crate) fn process(&mut self, queue: &mut RequestQueue, policy: &mut PipelinePolicy) -> DemuxStep {
        loop {
            if self.paused {
                if let Some(step) = self.check_held_back(queue) {
                    return step;
                }
                if self.paused {
                    return DemuxStep::Paused;
                }
            }
            let Some(event) = self.events.pop_front() else {
                return DemuxStep::Drained;
            };

            match event {
                ParserEvent::MessageBegin => {
                    self.current = Some(InProgress::default());
                }

                ParserEvent::Headers(head) => {
                    let current = self.current.get_or_insert_with(InProgress::default);
                    if head.is_informational() {
                        trace!(status = %head.status(), "interim response discarded");
                        current.informational = true;
                        continue;
                    }

                    let Some(entry) = queue.peek_head_mut() else {
                        return DemuxStep::Fatal(ParseError::UnexpectedResponse.into());
                    };
                    if entry.is_abort_requested() {
                        return DemuxStep::Aborted(entry.id());
                    }

                    policy.observe(head.flags());
                    current.until_close = head.is_close_delimited();
                    entry.set_response_state(ResponseState::HeadersReceived);

                    if head.is_upgrade() {
                        current.upgrade = Some(head);
                        continue;
                    }

                    debug!(id = %entry.id(), status = %head.status(), "response head received");
                    let resume = ResumeHandle::entry(entry.id(), self.commands.clone());
                    if let Some(handler) = entry.handler_mut() {
                        self.paused = !handler.on_headers(&head, resume);
                    }
                }

                ParserEvent::Data(chunk) => {
                    let current = self.current.get_or_insert_with(InProgress::default);
                    if current.informational {
                        continue;
                    }

                    let Some(entry) = queue.peek_head_mut() else {
                        return DemuxStep::Fatal(ParseError::UnexpectedResponse.into());
                    };
                    if entry.is_abort_requested() {
                        return DemuxStep::Aborted(entry.id());
                    }

                    current.received += chunk.len();
                    if let Some(max_size) = self.max_response_size.filter(|max| current.received > *max) {
                        if current.until_close {
                            return DemuxStep::Fatal(ClientError::ResponseTooLarge { max_size });
                        }
                        if !current.discarding {
                            warn!(id = %entry.id(), max_size, "response body too large, discarding the rest");
                            current.discarding = true;
                            entry.fail(ClientError::ResponseTooLarge { max_size });
                        }
                        continue;
                    }
                    if current.discarding {
                        continue;
                    }

                    entry.set_response_state(ResponseState::BodyStreaming);
                    if let Some(handler) = entry.handler_mut() {
                        self.paused = !handler.on_data(chunk);
                    }
                }

                ParserEvent::Trailers(trailers) => {
                    self.current.get_or_insert_with(InProgress::default).trailers = trailers;
                }

                ParserEvent::MessageComplete => {
                    let current = self.current.take().unwrap_or_default();
                    if current.informational {
                        continue;
                    }

                    let Some(entry) = queue.peek_head_mut() else {
                        return DemuxStep::Fatal(ParseError::UnexpectedResponse.into());
                    };
                    if entry.is_abort_requested() {
                        return DemuxStep::Aborted(entry.id());
                    }

                    entry.set_response_state(ResponseState::Done);
                    entry.complete(current.trailers);
                    queue.pop_head();
                }

                ParserEvent::Upgrade(remainder) => {
                    return match self.current.take().and_then(|c| c.upgrade) {
                        Some(head) => DemuxStep::Upgrade { head, remainder },
                        None => DemuxStep::Fatal(ClientError::parse("protocol switch without a response head")),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use http::{StatusCode, Version};

    use crate::config::ClientConfig;
    use crate::connection::client::Shared;
    use crate::connection::queue::WriteState;
    use crate::handler::Handler;
    use crate::protocol::{HeadFlags, PayloadSize, RequestDescriptor};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Logger {
        log: Log,
        pause_on_data: bool,
    }

    impl Handler for Logger {
        fn on_headers(&mut self, head: &ResponseHead, _resume: ResumeHandle) -> bool {
            self.log.lock().unwrap().push(format!("headers {}", head.status().as_u16()));
            true
        }

        fn on_data(&mut self, chunk: Bytes) -> bool {
            self.log.lock().unwrap().push(format!("data {}", String::from_utf8_lossy(&chunk)));
            !self.pause_on_data
        }

        fn on_complete(&mut self, trailers: HeaderList) {
            self.log.lock().unwrap().push(format!("complete {}", trailers.len()));
        }

        fn on_error(&mut self, error: ClientError) {
            self.log.lock().unwrap().push(format!("error {error}"));
        }
    }

    struct Fixture {
        queue: RequestQueue,
        policy: PipelinePolicy,
        demux: Demultiplexer,
        log: Log,
        _commands: mpsc::UnboundedReceiver<Command>,
    }

    fn fixture(max_response_size: Option<usize>, pause_on_data: bool, requests: usize) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Log::default();
        let mut queue = RequestQueue::new(Arc::new(Shared::new(requests)));
        for _ in 0..requests {
            let id = queue.push(RequestDescriptor::get("/"), Box::new(Logger { log: Arc::clone(&log), pause_on_data }));
            queue.get_mut(id).unwrap().set_write_state(WriteState::Sent);
        }
        Fixture {
            queue,
            policy: PipelinePolicy::new(&ClientConfig::default().pipelining(requests)),
            demux: Demultiplexer::new(max_response_size, tx),
            log,
            _commands: rx,
        }
    }

    fn head(status: u16, payload: PayloadSize) -> ParserEvent {
        let flags = HeadFlags { keep_alive: true, explicit_keep_alive: true, payload: Some(payload), ..HeadFlags::default() };
        ParserEvent::Headers(ResponseHead::new(Version::HTTP_11, StatusCode::from_u16(status).unwrap(), HeaderList::new(), flags))
    }

    fn data(s: &'static str) -> ParserEvent {
        ParserEvent::Data(Bytes::from_static(s.as_bytes()))
    }

    impl Fixture {
        fn run(&mut self, events: Vec<ParserEvent>) -> DemuxStep {
            self.demux.events_mut().extend(events);
            self.demux.process(&mut self.queue, &mut self.policy)
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[test]
    fn responses_follow_queue_order() {
        let mut f = fixture(None, false, 2);
        let step = f.run(vec![
            ParserEvent::MessageBegin,
            head(200, PayloadSize::Length(3)),
            data("one"),
            ParserEvent::MessageComplete,
            ParserEvent::MessageBegin,
            head(404, PayloadSize::Length(3)),
            data("two"),
            ParserEvent::MessageComplete,
        ]);

        assert!(matches!(step, DemuxStep::Drained));
        assert_eq!(f.log(), ["headers 200", "data one", "complete 0", "headers 404", "data two", "complete 0"]);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn interim_responses_are_discarded() {
        let mut f = fixture(None, false, 1);
        f.run(vec![
            ParserEvent::MessageBegin,
            head(100, PayloadSize::Empty),
            ParserEvent::MessageComplete,
            ParserEvent::MessageBegin,
            head(204, PayloadSize::Empty),
            ParserEvent::MessageComplete,
        ]);
        assert_eq!(f.log(), ["headers 204", "complete 0"]);
    }

    #[test]
    fn pause_holds_events_until_resume() {
        let mut f = fixture(None, true, 1);
        let step = f.run(vec![ParserEvent::MessageBegin, head(200, PayloadSize::Chunked), data("a"), data("b"), ParserEvent::MessageComplete]);

        assert!(matches!(step, DemuxStep::Paused));
        assert_eq!(f.log(), ["headers 200", "data a"]);
        assert_eq!(f.demux.pending_body_bytes(), 1);

        let id = f.queue.peek_head().unwrap().id();
        assert!(!f.demux.resume(EntryId::new(id.get() + 1), &f.queue));
        assert!(f.demux.resume(id, &f.queue));

        assert!(matches!(f.demux.process(&mut f.queue, &mut f.policy), DemuxStep::Paused));
        assert!(f.demux.resume(id, &f.queue));
        assert!(matches!(f.demux.process(&mut f.queue, &mut f.policy), DemuxStep::Drained));
        assert_eq!(f.log(), ["headers 200", "data a", "data b", "complete 0"]);
    }

    #[test]
    fn too_large_body_fails_one_entry() {
        let mut f = fixture(Some(4), false, 2);
        let step = f.run(vec![
            ParserEvent::MessageBegin,
            head(200, PayloadSize::Length(6)),
            data("abc"),
            data("def"),
            ParserEvent::MessageComplete,
            ParserEvent::MessageBegin,
            head(200, PayloadSize::Length(2)),
            data("ok"),
            ParserEvent::MessageComplete,
        ]);

        assert!(matches!(step, DemuxStep::Drained));
        assert_eq!(f.log(), ["headers 200", "data abc", "error response body exceeds the limit 4", "headers 200", "data ok", "complete 0"]);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn too_large_close_delimited_body_is_fatal() {
        let mut f = fixture(Some(4), false, 1);
        let step = f.run(vec![ParserEvent::MessageBegin, head(200, PayloadSize::UntilClose), data("abcdef")]);
        assert!(matches!(step, DemuxStep::Fatal(ClientError::ResponseTooLarge { max_size: 4 })));
    }

    #[test]
    fn held_back_body_over_the_limit_fails_the_paused_entry() {
        let mut f = fixture(Some(8), true, 2);
        let large = ParserEvent::Data(Bytes::from(vec![b'x'; 4096]));
        let step = f.run(vec![
            ParserEvent::MessageBegin,
            head(200, PayloadSize::Chunked),
            data("abc"),
            large,
            ParserEvent::MessageComplete,
            ParserEvent::MessageBegin,
            head(204, PayloadSize::Empty),
            ParserEvent::MessageComplete,
        ]);

        assert!(matches!(step, DemuxStep::Drained));
        assert!(!f.demux.is_paused());
        assert_eq!(f.log(), ["headers 200", "data abc", "error response body exceeds the limit 8", "headers 204", "complete 0"]);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn held_back_body_within_the_limit_stays_paused() {
        let mut f = fixture(Some(8), true, 1);
        let step = f.run(vec![ParserEvent::MessageBegin, head(200, PayloadSize::Chunked), data("abc"), data("defgh")]);

        assert!(matches!(step, DemuxStep::Paused));
        assert_eq!(f.demux.pending_body_bytes(), 5);
        assert_eq!(f.log(), ["headers 200", "data abc"]);
    }

    #[test]
    fn held_back_close_delimited_body_over_the_limit_is_fatal() {
        let mut f = fixture(Some(8), true, 1);
        let step = f.run(vec![ParserEvent::MessageBegin, head(200, PayloadSize::UntilClose), data("abc"), data("defghijk")]);
        assert!(matches!(step, DemuxStep::Fatal(ClientError::ResponseTooLarge { max_size: 8 })));
    }

    #[test]
    fn headers_update_policy() {
        let mut f = fixture(None, false, 3);
        let mut flags = HeadFlags { keep_alive: false, payload: Some(PayloadSize::Empty), ..HeadFlags::default() };
        flags.explicit_keep_alive = false;
        let event = ParserEvent::Headers(ResponseHead::new(Version::HTTP_11, StatusCode::OK, HeaderList::new(), flags));

        f.run(vec![ParserEvent::MessageBegin, event, ParserEvent::MessageComplete]);
        assert_eq!(f.policy.depth(), 1);
        assert!(!f.policy.is_reusable());
    }

    #[test]
    fn abort_requested_inside_callback_stops_delivery() {
        let mut f = fixture(None, false, 1);
        f.run(vec![ParserEvent::MessageBegin, head(200, PayloadSize::Length(2))]);
        f.queue.peek_head().unwrap().mark_aborted();

        let step = f.run(vec![data("ab"), ParserEvent::MessageComplete]);
        assert!(matches!(step, DemuxStep::Aborted(_)));
        assert_eq!(f.log(), ["headers 200"]);
    }
}
