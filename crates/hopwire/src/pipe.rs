//! Pipe — message-level channel over one neighbor connection.
//!
//! A [`Pipe`] turns a raw payload channel (discovery transport or socket)
//! into an observer-driven, compressed, explicitly terminated message
//! channel. Messages that arrive before an observer is registered are
//! queued and flushed on registration. The pipe closes itself once both
//! sides have signalled they are done; a frame that cannot be inflated or
//! parsed closes the pipe and notifies the observer that it broke.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::codec;
use crate::error::ExchangeError;
use crate::identity::PeerId;
use crate::message::{Message, PipeFrame};
use crate::transport::{Neighbor, PayloadObserver, Transport};

/// Outcome of sending one message, reported to the pipe observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    Failure,
}

/// The single consumer of one pipe's inbound messages and events.
#[async_trait]
pub trait PipeObserver: Send + Sync {
    /// Called once for every message pushed in from the other side.
    async fn on_message_received(&self, message: Message);

    /// Called when sending a previously pushed message finished.
    async fn on_delivery_result(&self, message: Message, result: DeliveryResult);

    /// Called when the pipe was closed because of an error.
    async fn on_pipe_broken(&self);

    /// Called when the pipe closed cleanly (both sides signalled done).
    async fn on_pipe_completed(&self);
}

/// Outbound half of the raw channel a pipe writes to. Implementations
/// must serialize writes (at most one in-flight write per pipe).
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ExchangeError>;

    /// Tear down the underlying connection.
    async fn disconnect(&self);
}

struct PipeState {
    observer: Option<Arc<dyn PipeObserver>>,
    queued: VecDeque<Message>,
    local_done: bool,
    peer_done: bool,
    closed: bool,
}

/// A message-level, bidirectional, explicitly terminated channel to one
/// neighbor.
pub struct Pipe {
    own_id: PeerId,
    neighbor: Neighbor,
    sink: Arc<dyn PayloadSink>,
    state: Mutex<PipeState>,
    /// Epoch milliseconds of the last push or receive, for idle timeouts.
    last_interaction: AtomicI64,
}

impl Pipe {
    pub fn new(own_id: PeerId, neighbor: Neighbor, sink: Arc<dyn PayloadSink>) -> Arc<Self> {
        Arc::new(Self {
            own_id,
            neighbor,
            sink,
            state: Mutex::new(PipeState {
                observer: None,
                queued: VecDeque::new(),
                local_done: false,
                peer_done: false,
                closed: false,
            }),
            last_interaction: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        })
    }

    pub fn neighbor(&self) -> &Neighbor {
        &self.neighbor
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("pipe lock poisoned").closed
    }

    /// Epoch milliseconds of the last payload activity on this pipe.
    pub fn last_interaction_ms(&self) -> i64 {
        self.last_interaction.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_interaction
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Register the consumer of incoming messages. Messages received
    /// before registration are flushed to it immediately, in arrival
    /// order.
    pub async fn set_observer(
        &self,
        observer: Arc<dyn PipeObserver>,
    ) -> Result<(), ExchangeError> {
        let backlog = {
            let mut state = self.state.lock().expect("pipe lock poisoned");
            if state.closed {
                return Err(ExchangeError::PipeState(
                    "cannot interact with a closed pipe",
                ));
            }
            state.observer = Some(observer.clone());
            std::mem::take(&mut state.queued)
        };
        for message in backlog {
            observer.on_message_received(message).await;
        }
        Ok(())
    }

    /// Serialize, compress and hand `message` to the sink. The delivery
    /// result arrives asynchronously at the observer.
    pub fn push(self: &Arc<Self>, message: Message) -> Result<(), ExchangeError> {
        let observer = {
            let state = self.state.lock().expect("pipe lock poisoned");
            if state.closed {
                return Err(ExchangeError::PipeState(
                    "cannot interact with a closed pipe",
                ));
            }
            if state.local_done {
                return Err(ExchangeError::PipeState(
                    "cannot send messages after signal_done",
                ));
            }
            match &state.observer {
                Some(observer) => observer.clone(),
                None => {
                    return Err(ExchangeError::PipeState(
                        "cannot send a message before an observer is set",
                    ))
                }
            }
        };
        self.touch();
        debug!(
            from = %self.own_id,
            to = %self.neighbor.id,
            kind = message.kind_name(),
            id = message.content_id().unwrap_or(""),
            "sending message"
        );
        let bytes = codec::encode(&PipeFrame::Content(message.clone()))?;

        let pipe = Arc::clone(self);
        tokio::spawn(async move {
            let result = match pipe.sink.send(bytes).await {
                Ok(()) => DeliveryResult::Success,
                Err(e) => {
                    warn!(
                        to = %pipe.neighbor.id,
                        kind = message.kind_name(),
                        "sending message failed: {e}"
                    );
                    DeliveryResult::Failure
                }
            };
            observer.on_delivery_result(message, result).await;
        });
        Ok(())
    }

    /// Mark the local side as finished and send the done control frame.
    /// Closes the pipe if the peer already signalled done.
    pub async fn signal_done(&self) -> Result<(), ExchangeError> {
        let close_now = {
            let mut state = self.state.lock().expect("pipe lock poisoned");
            if state.closed {
                return Err(ExchangeError::PipeState(
                    "cannot interact with a closed pipe",
                ));
            }
            state.local_done = true;
            state.peer_done
        };
        self.touch();
        debug!(from = %self.own_id, to = %self.neighbor.id, "signalling done");
        let bytes = codec::encode(&PipeFrame::SignalDone)?;
        if let Err(e) = self.sink.send(bytes).await {
            debug!(to = %self.neighbor.id, "sending done frame failed: {e}");
        }
        if close_now {
            self.close_inner(false).await;
        }
        Ok(())
    }

    /// Terminal operation; idempotent. Detaches the observer and, on the
    /// side whose id is the greater one, tears down the underlying
    /// connection (the other side waits to be disconnected).
    pub async fn close(&self) {
        self.close_inner(false).await;
    }

    async fn close_inner(&self, broken: bool) {
        let observer = {
            let mut state = self.state.lock().expect("pipe lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.local_done = true;
            state.observer.take()
        };
        debug!(own = %self.own_id, neighbor = %self.neighbor.id, broken, "pipe closed");
        if let Some(observer) = observer {
            if broken {
                observer.on_pipe_broken().await;
            } else {
                observer.on_pipe_completed().await;
            }
        }
        if self.own_id > self.neighbor.id {
            self.sink.disconnect().await;
        }
    }

    /// Feed one raw inbound payload into the pipe: decompress, decode and
    /// dispatch it. Undecodable frames break the pipe; payloads arriving
    /// after close are dropped.
    pub async fn handle_incoming(&self, bytes: &[u8]) {
        self.touch();
        match codec::decode(bytes) {
            Ok(PipeFrame::Content(message)) => {
                debug!(
                    from = %self.neighbor.id,
                    to = %self.own_id,
                    kind = message.kind_name(),
                    id = message.content_id().unwrap_or(""),
                    "message received"
                );
                let observer = {
                    let mut state = self.state.lock().expect("pipe lock poisoned");
                    if state.closed {
                        return;
                    }
                    match &state.observer {
                        Some(observer) => observer.clone(),
                        None => {
                            state.queued.push_back(message);
                            return;
                        }
                    }
                };
                observer.on_message_received(message).await;
            }
            Ok(PipeFrame::SignalDone) => {
                let close_now = {
                    let mut state = self.state.lock().expect("pipe lock poisoned");
                    if state.closed {
                        return;
                    }
                    state.peer_done = true;
                    state.local_done
                };
                debug!(from = %self.neighbor.id, "peer signalled done");
                if close_now {
                    self.close_inner(false).await;
                }
            }
            Err(e @ ExchangeError::Decompression(_)) => {
                error!(from = %self.neighbor.id, "received bytes that couldn't be decompressed: {e}");
                self.close_inner(true).await;
            }
            Err(e) => {
                warn!(from = %self.neighbor.id, "received a frame that couldn't be decoded: {e}");
                self.close_inner(true).await;
            }
        }
    }
}

/// [`PayloadSink`] over a discovery transport's payload primitive.
pub struct TransportSink {
    transport: Arc<dyn Transport>,
    neighbor: Neighbor,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>, neighbor: Neighbor) -> Self {
        Self { transport, neighbor }
    }
}

#[async_trait]
impl PayloadSink for TransportSink {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ExchangeError> {
        self.transport.send_payload(&self.neighbor, bytes).await
    }

    async fn disconnect(&self) {
        self.transport.disconnect(&self.neighbor).await;
    }
}

/// Adapter feeding a transport's payload callback into a pipe.
pub struct PipePayloadObserver {
    pipe: Arc<Pipe>,
}

impl PipePayloadObserver {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        Self { pipe }
    }
}

#[async_trait]
impl PayloadObserver for PipePayloadObserver {
    async fn on_payload_received(&self, _neighbor: &Neighbor, bytes: Vec<u8>) {
        self.pipe.handle_incoming(&bytes).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentMessage, Priority};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
        disconnects: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                disconnects: AtomicUsize::new(0),
            })
        }

        fn frames(&self) -> Vec<PipeFrame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|b| codec::decode(b).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl PayloadSink for RecordingSink {
        async fn send(&self, bytes: Vec<u8>) -> Result<(), ExchangeError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ExchangeError::Transport("sink unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(bytes);
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Received(String),
        Delivered(String, DeliveryResult),
        Broken,
        Completed,
    }

    struct RecordingObserver {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| format!("{e:?}"))
                .collect()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    #[async_trait]
    impl PipeObserver for RecordingObserver {
        async fn on_message_received(&self, message: Message) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Received(message.kind_name().to_string()));
        }

        async fn on_delivery_result(&self, message: Message, result: DeliveryResult) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Delivered(message.kind_name().to_string(), result));
        }

        async fn on_pipe_broken(&self) {
            self.events.lock().unwrap().push(Event::Broken);
        }

        async fn on_pipe_completed(&self) {
            self.events.lock().unwrap().push(Event::Completed);
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn neighbor(id: &str) -> Neighbor {
        Neighbor::new(peer(id), "test")
    }

    fn content(id: &str) -> Message {
        Message::Content(ContentMessage {
            id: id.to_string(),
            from_id: peer("aaa"),
            to_id: peer("bbb"),
            service_id: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ttl_hours: 1,
            priority: Priority::Low,
            body: vec![1, 2, 3],
        })
    }

    #[tokio::test]
    async fn test_push_before_observer_fails() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let result = pipe.push(content("m1"));
        assert!(matches!(result, Err(ExchangeError::PipeState(_))));
    }

    #[tokio::test]
    async fn test_early_messages_queued_and_flushed_in_order() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);

        let m1 = codec::encode(&PipeFrame::Content(content("m1"))).unwrap();
        let m2 = codec::encode(&PipeFrame::Content(content("m2"))).unwrap();
        pipe.handle_incoming(&m1).await;
        pipe.handle_incoming(&m2).await;

        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.contains("Received")));
    }

    #[tokio::test]
    async fn test_push_delivers_and_reports_success() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink.clone());
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        pipe.push(content("m1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], PipeFrame::Content(Message::Content(_))));
        assert_eq!(
            observer.count(|e| matches!(e, Event::Delivered(_, DeliveryResult::Success))),
            1
        );
    }

    #[tokio::test]
    async fn test_send_failure_reports_failure_result() {
        let sink = RecordingSink::new();
        sink.fail.store(true, Ordering::SeqCst);
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        pipe.push(content("m1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            observer.count(|e| matches!(e, Event::Delivered(_, DeliveryResult::Failure))),
            1
        );
    }

    #[tokio::test]
    async fn test_push_after_signal_done_fails() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer).await.unwrap();

        pipe.signal_done().await.unwrap();
        let result = pipe.push(content("m1"));
        assert!(matches!(result, Err(ExchangeError::PipeState(_))));
    }

    #[tokio::test]
    async fn test_both_done_closes_exactly_once() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        pipe.signal_done().await.unwrap();
        assert!(!pipe.is_closed());

        let done = codec::encode(&PipeFrame::SignalDone).unwrap();
        pipe.handle_incoming(&done).await;
        assert!(pipe.is_closed());

        // Duplicate done frames and extra closes are ignored.
        pipe.handle_incoming(&done).await;
        pipe.close().await;
        pipe.close().await;

        assert_eq!(observer.count(|e| matches!(e, Event::Completed)), 1);
        assert_eq!(observer.count(|e| matches!(e, Event::Broken)), 0);
    }

    #[tokio::test]
    async fn test_undecodable_frame_breaks_pipe() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        pipe.handle_incoming(b"not a frame at all").await;

        assert!(pipe.is_closed());
        assert_eq!(observer.count(|e| matches!(e, Event::Broken)), 1);

        // The pipe is unusable afterwards.
        assert!(matches!(
            pipe.set_observer(RecordingObserver::new()).await,
            Err(ExchangeError::PipeState(_))
        ));
        assert!(matches!(
            pipe.push(content("m1")),
            Err(ExchangeError::PipeState(_))
        ));
    }

    #[tokio::test]
    async fn test_compressed_garbage_breaks_pipe() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();

        // Valid zlib stream, invalid envelope.
        let bytes = codec::compress(b"[1, 2, 3]").unwrap();
        pipe.handle_incoming(&bytes).await;

        assert!(pipe.is_closed());
        assert_eq!(observer.count(|e| matches!(e, Event::Broken)), 1);
    }

    #[tokio::test]
    async fn test_only_greater_id_disconnects() {
        // Greater own id tears the connection down.
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("bbb"), neighbor("aaa"), sink.clone());
        pipe.close().await;
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 1);

        // Lesser own id waits to be disconnected.
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink.clone());
        pipe.close().await;
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incoming_after_close_is_dropped() {
        let sink = RecordingSink::new();
        let pipe = Pipe::new(peer("aaa"), neighbor("bbb"), sink);
        let observer = RecordingObserver::new();
        pipe.set_observer(observer.clone()).await.unwrap();
        pipe.close().await;

        let m1 = codec::encode(&PipeFrame::Content(content("m1"))).unwrap();
        pipe.handle_incoming(&m1).await;
        assert_eq!(observer.count(|e| matches!(e, Event::Received(_))), 0);
    }
}
