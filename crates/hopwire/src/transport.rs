//! Transport seam — the interface a short-range connectivity
//! implementation has to provide.
//!
//! The exchange core never talks to radios or sockets directly for
//! discovery-backed connectivity; it drives a [`Transport`] and reacts to
//! its callbacks. Implementations wrap whatever the host platform offers
//! (a BLE/Wi-Fi-Direct style discovery service, or an in-process hub in
//! tests).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::identity::PeerId;

/// A discovered, connectable peer: a validated id plus whatever endpoint
/// data the transport needs to address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Neighbor {
    pub id: PeerId,
    /// Transport-specific endpoint handle (an address, an endpoint id, …).
    pub endpoint: String,
}

impl Neighbor {
    pub fn new(id: PeerId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for Neighbor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

/// Callback surface for the connection lifecycle of one neighbor.
#[async_trait]
pub trait ConnectionLifecycle: Send + Sync {
    /// A connection with `neighbor` was initiated (by either side). It has
    /// to be accepted via [`Transport::accept_connection`] to be usable.
    async fn on_connection_initiated(&self, neighbor: &Neighbor);

    /// The initiated connection was accepted (`Ok`) or failed/was
    /// rejected/timed out (`Err` with a transport-supplied reason).
    async fn on_connection_result(&self, neighbor: &Neighbor, result: Result<(), String>);

    /// The connection to `neighbor` ended.
    async fn on_disconnected(&self, neighbor: &Neighbor);
}

/// Callback surface for discovery results.
#[async_trait]
pub trait DiscoveryObserver: Send + Sync {
    async fn on_neighbor_found(&self, neighbor: Neighbor);

    async fn on_neighbor_lost(&self, neighbor: Neighbor);
}

/// Callback surface for inbound payloads on one accepted connection.
#[async_trait]
pub trait PayloadObserver: Send + Sync {
    /// Invoked once per payload, after it has transferred completely.
    async fn on_payload_received(&self, neighbor: &Neighbor, bytes: Vec<u8>);
}

/// Discovery/advertising, connection lifecycle, and payload primitives
/// for named neighbors.
///
/// All methods are non-blocking from the caller's perspective; longer
/// work happens on the transport's own tasks and is reported through the
/// registered callbacks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The id of the device this transport runs on.
    fn own_id(&self) -> &PeerId;

    /// Start advertising the own id; incoming connections are reported to
    /// `lifecycle`.
    async fn start_advertising(
        &self,
        lifecycle: Arc<dyn ConnectionLifecycle>,
    ) -> Result<(), ExchangeError>;

    async fn stop_advertising(&self);

    /// Start discovering neighbors; findings are reported to `observer`.
    async fn start_discovery(
        &self,
        observer: Arc<dyn DiscoveryObserver>,
    ) -> Result<(), ExchangeError>;

    async fn stop_discovery(&self);

    /// Ask `neighbor` to connect. The outcome arrives on `lifecycle`.
    async fn request_connection(
        &self,
        neighbor: &Neighbor,
        lifecycle: Arc<dyn ConnectionLifecycle>,
    ) -> Result<(), ExchangeError>;

    /// Accept an initiated connection and register the consumer of its
    /// inbound payloads.
    async fn accept_connection(
        &self,
        neighbor: &Neighbor,
        payloads: Arc<dyn PayloadObserver>,
    ) -> Result<(), ExchangeError>;

    /// Send one payload to a connected neighbor. The returned result is
    /// the delivery result.
    async fn send_payload(&self, neighbor: &Neighbor, bytes: Vec<u8>) -> Result<(), ExchangeError>;

    /// Tear down the connection to `neighbor`, if any.
    async fn disconnect(&self, neighbor: &Neighbor);

    /// Currently visible neighbors (snapshot, not updated).
    async fn neighbors(&self) -> Vec<Neighbor>;

    /// Currently connected neighbors (snapshot, not updated).
    async fn connected_neighbors(&self) -> Vec<Neighbor>;

    /// Stop all activity. The transport must not be used afterwards.
    async fn close(&self);
}
