//! Repository seams for content messages and acknowledgements, with
//! in-memory implementations used by the standalone server and tests.
//!
//! Durable storage is the host application's concern; the exchange core
//! only needs these narrow interfaces. Deduplication by message id is a
//! repository responsibility: `add` with an already-known id is a no-op
//! overwrite.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::message::{Ack, ContentMessage};

/// Durable store of pending content messages, keyed by id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn add(&self, message: ContentMessage);

    /// All stored messages that are not expired at `now_ms`.
    async fn all_non_expired(&self, now_ms: i64) -> Vec<ContentMessage>;

    async fn delete_by_ids(&self, ids: &[String]);
}

/// Durable store of acknowledgements, keyed by message id.
#[async_trait]
pub trait AckStore: Send + Sync {
    async fn add(&self, ack: Ack);

    async fn add_all(&self, acks: Vec<Ack>);

    /// All stored acks that are still valid at `now_ms`.
    async fn non_expired(&self, now_ms: i64) -> Vec<Ack>;

    /// Drop acks whose expiry date has passed at `now_ms`.
    async fn delete_expired(&self, now_ms: i64);
}

/// In-memory [`MessageStore`]; nothing is persisted across restarts.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<String, ContentMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages
            .lock()
            .expect("store lock poisoned")
            .contains_key(id)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn add(&self, message: ContentMessage) {
        self.messages
            .lock()
            .expect("store lock poisoned")
            .insert(message.id.clone(), message);
    }

    async fn all_non_expired(&self, now_ms: i64) -> Vec<ContentMessage> {
        self.messages
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|m| !m.is_expired(now_ms))
            .cloned()
            .collect()
    }

    async fn delete_by_ids(&self, ids: &[String]) {
        let mut messages = self.messages.lock().expect("store lock poisoned");
        for id in ids {
            messages.remove(id);
        }
    }
}

/// In-memory [`AckStore`]; nothing is persisted across restarts.
#[derive(Default)]
pub struct MemoryAckStore {
    acks: Mutex<HashMap<String, Ack>>,
}

impl MemoryAckStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.acks.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.acks
            .lock()
            .expect("store lock poisoned")
            .contains_key(id)
    }
}

#[async_trait]
impl AckStore for MemoryAckStore {
    async fn add(&self, ack: Ack) {
        self.acks
            .lock()
            .expect("store lock poisoned")
            .insert(ack.id.clone(), ack);
    }

    async fn add_all(&self, acks: Vec<Ack>) {
        let mut map = self.acks.lock().expect("store lock poisoned");
        for ack in acks {
            map.insert(ack.id.clone(), ack);
        }
    }

    async fn non_expired(&self, now_ms: i64) -> Vec<Ack> {
        self.acks
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|a| !a.is_expired(now_ms))
            .cloned()
            .collect()
    }

    async fn delete_expired(&self, now_ms: i64) {
        self.acks
            .lock()
            .expect("store lock poisoned")
            .retain(|_, a| !a.is_expired(now_ms));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
