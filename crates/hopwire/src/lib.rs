//! Hopwire — delay-tolerant, opportunistic message exchange.
//!
//! This crate implements store-and-forward gossip between peers that are
//! only intermittently connected: devices advertise themselves, discover
//! neighbors, and whenever two of them meet they diff their message
//! inventories and forward each other everything the other side is
//! missing. Delivery is eventual and best-effort; every peer carries
//! messages for everyone else until they expire or (with the
//! acknowledging strategy) a delivery receipt is seen.
//!
//! # Architecture
//!
//! - **Transport**: pluggable; a [`transport::Transport`] wraps whatever
//!   connectivity the host offers, and TCP sockets are supported
//!   directly via the rendezvous server/link.
//! - **Pipe**: message-level channel over one connection — compression,
//!   envelope codec, explicit mutual termination.
//! - **Routers**: per-session exchange strategies (plain gossip, or
//!   gossip with receipts), selected by configuration.
//! - **Watcher**: the top-level loop owning discovery, neighbor
//!   selection, and session dispatch.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hopwire::{ExchangeConfig, ExchangeContext, NeighborhoodWatcher, PeerId};
//! use hopwire::store::{MemoryAckStore, MemoryMessageStore};
//!
//! # async fn example(transport: Arc<dyn hopwire::transport::Transport>) {
//! let ctx = ExchangeContext::new(
//!     PeerId::new("device1111").unwrap(),
//!     ExchangeConfig::default(),
//!     Arc::new(MemoryMessageStore::new()),
//!     Arc::new(MemoryAckStore::new()),
//! );
//! let watcher = NeighborhoodWatcher::new(ctx, transport);
//! watcher.start().await.unwrap();
//! // ... exchanging with whoever comes into range ...
//! watcher.stop().await;
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod pipe;
pub mod rendezvous;
pub mod router;
pub mod socket;
pub mod store;
pub mod transport;
pub mod watcher;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{ExchangeConfig, ExchangeContext, RouterKind, DEFAULT_SERVER_PORT};
pub use error::ExchangeError;
pub use identity::PeerId;
pub use message::{Ack, ContentMessage, ListExchangeMessage, Message, Priority};
pub use pipe::{DeliveryResult, Pipe, PipeObserver};
pub use rendezvous::{RendezvousServer, ServerLink};
pub use transport::Neighbor;
pub use watcher::NeighborhoodWatcher;
