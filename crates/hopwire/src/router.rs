//! Message routers — the per-session exchange strategies, and the
//! chooser that binds a fresh pipe to one of them.
//!
//! A router drives exactly one session over one pipe: it opens with a
//! manifest of locally known message ids, computes the pending-send set
//! from the peer's manifest, forwards those messages one at a time
//! (each send waits for the previous delivery result), and signals done
//! once nothing is left. The acknowledging variant additionally gossips
//! delivery receipts and stops carrying messages it has receipts for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RouterKind;
use crate::identity::PeerId;
use crate::message::{Ack, ContentMessage, ListExchangeMessage, Message};
use crate::pipe::{DeliveryResult, Pipe, PipeObserver};
use crate::store::{AckStore, MessageStore};

/// One exchange strategy, consumed by starting its session.
#[async_trait]
pub trait MessageRouter: PipeObserver {
    /// Register on the pipe and open the session with the local manifest.
    async fn send_messages(self: Arc<Self>);
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct SessionState {
    pending: VecDeque<ContentMessage>,
    list_received: bool,
}

impl SessionState {
    fn new() -> Mutex<Self> {
        Mutex::new(Self {
            pending: VecDeque::new(),
            list_received: false,
        })
    }
}

fn retain_whitelisted(messages: &mut Vec<ContentMessage>, whitelist: &Option<Vec<u8>>) {
    if let Some(allowed) = whitelist {
        messages.retain(|m| allowed.contains(&m.service_id));
    }
}

/// Plain gossip: forward everything the peer doesn't know, keep
/// everything forever (until it expires).
pub struct SimpleRouter {
    own_id: PeerId,
    neighbor_id: PeerId,
    pipe: Arc<Pipe>,
    messages: Arc<dyn MessageStore>,
    service_whitelist: Option<Vec<u8>>,
    session: Mutex<SessionState>,
    finished: AtomicBool,
}

impl SimpleRouter {
    pub fn new(
        own_id: PeerId,
        pipe: Arc<Pipe>,
        messages: Arc<dyn MessageStore>,
        service_whitelist: Option<Vec<u8>>,
    ) -> Arc<Self> {
        let neighbor_id = pipe.neighbor().id.clone();
        Arc::new(Self {
            own_id,
            neighbor_id,
            pipe,
            messages,
            service_whitelist,
            session: SessionState::new(),
            finished: AtomicBool::new(false),
        })
    }

    /// Send the next pending message, or signal done when none is left.
    async fn advance(&self) {
        let next = {
            let mut session = self.session.lock().expect("router lock poisoned");
            session.pending.pop_front()
        };
        match next {
            Some(message) => {
                if let Err(e) = self.pipe.push(Message::Content(message)) {
                    debug!(neighbor = %self.neighbor_id, "dropping pending send: {e}");
                }
            }
            None => self.finish().await,
        }
    }

    async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pipe.signal_done().await {
            debug!(neighbor = %self.neighbor_id, "could not signal done: {e}");
        }
    }
}

#[async_trait]
impl MessageRouter for SimpleRouter {
    async fn send_messages(self: Arc<Self>) {
        if let Err(e) = self.pipe.set_observer(self.clone()).await {
            warn!(neighbor = %self.neighbor_id, "session could not start: {e}");
            return;
        }
        let known_message_ids = self
            .messages
            .all_non_expired(now_ms())
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        let manifest = Message::ListExchange(ListExchangeMessage {
            from_id: self.own_id.clone(),
            to_id: self.neighbor_id.clone(),
            known_message_ids,
            known_ack_ids: Vec::new(),
        });
        if let Err(e) = self.pipe.push(manifest) {
            warn!(neighbor = %self.neighbor_id, "could not send manifest: {e}");
        }
    }
}

#[async_trait]
impl PipeObserver for SimpleRouter {
    async fn on_message_received(&self, message: Message) {
        match message {
            Message::Content(content) => {
                self.messages.add(content).await;
            }
            Message::ListExchange(list) => {
                {
                    let mut session = self.session.lock().expect("router lock poisoned");
                    if session.list_received {
                        // Only the first manifest of a session counts.
                        return;
                    }
                    session.list_received = true;
                }
                let mut wanted = self.messages.all_non_expired(now_ms()).await;
                wanted.retain(|m| !list.known_message_ids.contains(&m.id));
                retain_whitelisted(&mut wanted, &self.service_whitelist);
                info!(
                    neighbor = %self.neighbor_id,
                    pending = wanted.len(),
                    "manifest received, forwarding difference"
                );
                {
                    let mut session = self.session.lock().expect("router lock poisoned");
                    session.pending = wanted.into();
                }
                self.advance().await;
            }
        }
    }

    async fn on_delivery_result(&self, message: Message, result: DeliveryResult) {
        if let Message::Content(content) = message {
            if result == DeliveryResult::Failure {
                // The message stays in the store for a later session.
                debug!(neighbor = %self.neighbor_id, id = %content.id, "delivery failed");
            }
            self.advance().await;
        }
    }

    async fn on_pipe_broken(&self) {
        warn!(neighbor = %self.neighbor_id, "session aborted, pipe broke");
    }

    async fn on_pipe_completed(&self) {
        info!(neighbor = %self.neighbor_id, "session completed");
    }
}

/// Gossip with receipts: advertises acks alongside message ids, stops
/// carrying messages once a receipt for them is known, and synthesizes
/// receipts on final delivery (inbound to the own id, or outbound
/// confirmed to the destination).
pub struct AcknowledgingRouter {
    own_id: PeerId,
    neighbor_id: PeerId,
    pipe: Arc<Pipe>,
    messages: Arc<dyn MessageStore>,
    acks: Arc<dyn AckStore>,
    service_whitelist: Option<Vec<u8>>,
    session: Mutex<SessionState>,
    finished: AtomicBool,
}

impl AcknowledgingRouter {
    pub fn new(
        own_id: PeerId,
        pipe: Arc<Pipe>,
        messages: Arc<dyn MessageStore>,
        acks: Arc<dyn AckStore>,
        service_whitelist: Option<Vec<u8>>,
    ) -> Arc<Self> {
        let neighbor_id = pipe.neighbor().id.clone();
        Arc::new(Self {
            own_id,
            neighbor_id,
            pipe,
            messages,
            acks,
            service_whitelist,
            session: SessionState::new(),
            finished: AtomicBool::new(false),
        })
    }

    async fn advance(&self) {
        let next = {
            let mut session = self.session.lock().expect("router lock poisoned");
            session.pending.pop_front()
        };
        match next {
            Some(message) => {
                if let Err(e) = self.pipe.push(Message::Content(message)) {
                    debug!(neighbor = %self.neighbor_id, "dropping pending send: {e}");
                }
            }
            None => self.finish().await,
        }
    }

    async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pipe.signal_done().await {
            debug!(neighbor = %self.neighbor_id, "could not signal done: {e}");
        }
    }

    /// Record that `message` reached its destination.
    async fn acknowledge(&self, message: &ContentMessage) {
        self.acks
            .add(Ack {
                id: message.id.clone(),
                expiry_date: message.expires_at(),
            })
            .await;
    }
}

#[async_trait]
impl MessageRouter for AcknowledgingRouter {
    async fn send_messages(self: Arc<Self>) {
        if let Err(e) = self.pipe.set_observer(self.clone()).await {
            warn!(neighbor = %self.neighbor_id, "session could not start: {e}");
            return;
        }
        let now = now_ms();
        self.acks.delete_expired(now).await;
        let known_message_ids = self
            .messages
            .all_non_expired(now)
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        let known_ack_ids = self.acks.non_expired(now).await;
        let manifest = Message::ListExchange(ListExchangeMessage {
            from_id: self.own_id.clone(),
            to_id: self.neighbor_id.clone(),
            known_message_ids,
            known_ack_ids,
        });
        if let Err(e) = self.pipe.push(manifest) {
            warn!(neighbor = %self.neighbor_id, "could not send manifest: {e}");
        }
    }
}

#[async_trait]
impl PipeObserver for AcknowledgingRouter {
    async fn on_message_received(&self, message: Message) {
        match message {
            Message::Content(content) => {
                let arrived = content.to_id == self.own_id;
                self.messages.add(content.clone()).await;
                if arrived {
                    // Reaching the destination is the acknowledgement.
                    self.acknowledge(&content).await;
                }
            }
            Message::ListExchange(list) => {
                {
                    let mut session = self.session.lock().expect("router lock poisoned");
                    if session.list_received {
                        return;
                    }
                    session.list_received = true;
                }
                let now = now_ms();
                self.acks.add_all(list.known_ack_ids).await;

                // Acknowledged messages no longer need carrying.
                let acked: Vec<String> = self
                    .acks
                    .non_expired(now)
                    .await
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                self.messages.delete_by_ids(&acked).await;

                let mut wanted = self.messages.all_non_expired(now).await;
                wanted.retain(|m| !list.known_message_ids.contains(&m.id));
                retain_whitelisted(&mut wanted, &self.service_whitelist);
                info!(
                    neighbor = %self.neighbor_id,
                    pending = wanted.len(),
                    "manifest received, forwarding difference"
                );
                {
                    let mut session = self.session.lock().expect("router lock poisoned");
                    session.pending = wanted.into();
                }
                self.advance().await;
            }
        }
    }

    async fn on_delivery_result(&self, message: Message, result: DeliveryResult) {
        if let Message::Content(content) = message {
            if result == DeliveryResult::Success && content.to_id == self.neighbor_id {
                // Handed directly to the destination; the transport's
                // delivery confirmation stands in for a receipt.
                self.acknowledge(&content).await;
            }
            self.advance().await;
        }
    }

    async fn on_pipe_broken(&self) {
        warn!(neighbor = %self.neighbor_id, "session aborted, pipe broke");
    }

    async fn on_pipe_completed(&self) {
        info!(neighbor = %self.neighbor_id, "session completed");
    }
}

/// Binds a freshly established pipe to a router of the configured kind
/// and starts the session on its own task, so connection callbacks are
/// never blocked by session work.
pub struct MessageChooser {
    kind: RouterKind,
    messages: Arc<dyn MessageStore>,
    acks: Arc<dyn AckStore>,
    service_whitelist: Option<Vec<u8>>,
}

impl MessageChooser {
    pub fn new(
        kind: RouterKind,
        messages: Arc<dyn MessageStore>,
        acks: Arc<dyn AckStore>,
        service_whitelist: Option<Vec<u8>>,
    ) -> Self {
        Self {
            kind,
            messages,
            acks,
            service_whitelist,
        }
    }

    pub fn start_session(&self, own_id: PeerId, pipe: Arc<Pipe>) {
        debug!(kind = ?self.kind, neighbor = %pipe.neighbor().id, "starting session");
        let router: Arc<dyn MessageRouter> = match self.kind {
            RouterKind::Simple => SimpleRouter::new(
                own_id,
                pipe,
                self.messages.clone(),
                self.service_whitelist.clone(),
            ),
            RouterKind::Acknowledging => AcknowledgingRouter::new(
                own_id,
                pipe,
                self.messages.clone(),
                self.acks.clone(),
                self.service_whitelist.clone(),
            ),
        };
        tokio::spawn(router.send_messages());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
