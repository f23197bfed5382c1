//! Protocol data model — content messages, acknowledgements, and the
//! envelope sum types carried over a pipe.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Milliseconds per hour, used for TTL arithmetic.
pub const MS_PER_HOUR: i64 = 3_600_000;

/// Delivery priority of a content message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    High,
    Severe,
}

/// A store-and-forward content message.
///
/// The `id` is the deduplication key across the whole network: it is
/// either supplied by the caller or derived as a content hash. Messages
/// are immutable once created and expire `ttl_hours` after `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub id: String,
    pub from_id: PeerId,
    pub to_id: PeerId,
    pub service_id: u8,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
    pub ttl_hours: u8,
    pub priority: Priority,
    pub body: Vec<u8>,
}

impl ContentMessage {
    /// Create a message with a content-derived id and the current time.
    pub fn new(
        from_id: PeerId,
        to_id: PeerId,
        service_id: u8,
        ttl_hours: u8,
        priority: Priority,
        body: Vec<u8>,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let id = content_hash(
            &from_id, &to_id, service_id, timestamp, ttl_hours, priority, &body,
        );
        Self {
            id,
            from_id,
            to_id,
            service_id,
            timestamp,
            ttl_hours,
            priority,
            body,
        }
    }

    /// The instant (epoch milliseconds) at which this message expires.
    pub fn expires_at(&self) -> i64 {
        self.timestamp + self.ttl_hours as i64 * MS_PER_HOUR
    }

    /// Whether the message is expired at `now_ms`. Expired messages must
    /// never be advertised or forwarded.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at() <= now_ms
    }
}

fn content_hash(
    from_id: &PeerId,
    to_id: &PeerId,
    service_id: u8,
    timestamp: i64,
    ttl_hours: u8,
    priority: Priority,
    body: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from_id.as_str().as_bytes());
    hasher.update(to_id.as_str().as_bytes());
    hasher.update([service_id]);
    hasher.update(timestamp.to_be_bytes());
    hasher.update([ttl_hours]);
    hasher.update(format!("{priority:?}").as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A receipt recording that the message with `id` has been fully
/// delivered and no longer needs to be carried; valid until `expiry_date`
/// (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
    pub expiry_date: i64,
}

impl Ack {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_date <= now_ms
    }
}

/// The manifest exchanged at the start of every session: the ids of all
/// content messages the sender carries, plus (for the acknowledging
/// strategy) the acks it knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListExchangeMessage {
    pub from_id: PeerId,
    pub to_id: PeerId,
    pub known_message_ids: Vec<String>,
    #[serde(default)]
    pub known_ack_ids: Vec<Ack>,
}

/// A routable message, dispatched by an explicit discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    #[serde(rename = "content_message")]
    Content(ContentMessage),
    #[serde(rename = "list_exchange")]
    ListExchange(ListExchangeMessage),
}

impl Message {
    /// Short name of the concrete variant, for log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Content(_) => "ContentMessage",
            Self::ListExchange(_) => "ListExchangeMessage",
        }
    }

    /// The content-message id, if this is a content message.
    pub fn content_id(&self) -> Option<&str> {
        match self {
            Self::Content(m) => Some(&m.id),
            Self::ListExchange(_) => None,
        }
    }
}

/// The two kinds of frames a pipe transports: an application message, or
/// the control frame signalling that the sender has nothing left to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipeFrame {
    Content(Message),
    SignalDone,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
