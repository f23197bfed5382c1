//! Neighborhood watcher — advertises the own id, discovers neighbors,
//! and exchanges with one peer at a time.
//!
//! Connection setup is deliberately asymmetric: a device only requests
//! connections to neighbors whose id sorts greater than its own, and
//! always accepts incoming requests. For any pair of peers exactly one
//! side initiates, so duplicate simultaneous attempts cannot happen. A
//! periodic timer re-arms discovery, retries connecting, and disconnects
//! neighbors that have gone silent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ExchangeContext;
use crate::error::ExchangeError;
use crate::identity::PeerId;
use crate::pipe::{Pipe, PipePayloadObserver, TransportSink};
use crate::router::MessageChooser;
use crate::transport::{ConnectionLifecycle, DiscoveryObserver, Neighbor, Transport};

/// Top-level driver of opportunistic exchange over one transport.
pub struct NeighborhoodWatcher {
    inner: Arc<WatcherInner>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

struct WatcherInner {
    ctx: Arc<ExchangeContext>,
    transport: Arc<dyn Transport>,
    chooser: MessageChooser,
    self_ref: Weak<WatcherInner>,
    neighbors: Mutex<HashMap<PeerId, Neighbor>>,
    pipes: Mutex<HashMap<PeerId, Arc<Pipe>>>,
    /// Neighbor with a connection attempt in flight, if any.
    connecting: Mutex<Option<PeerId>>,
}

impl NeighborhoodWatcher {
    pub fn new(ctx: Arc<ExchangeContext>, transport: Arc<dyn Transport>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let chooser = ctx.chooser();
        Self {
            inner: Arc::new_cyclic(|self_ref| WatcherInner {
                ctx,
                transport,
                chooser,
                self_ref: self_ref.clone(),
                neighbors: Mutex::new(HashMap::new()),
                pipes: Mutex::new(HashMap::new()),
                connecting: Mutex::new(None),
            }),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Begin advertising and discovering, and arm the periodic timer.
    pub async fn start(&self) -> Result<(), ExchangeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ExchangeError::AlreadyStarted);
        }
        info!(own = %self.inner.ctx.own_id, "starting neighborhood watcher");
        let lifecycle: Arc<dyn ConnectionLifecycle> = self.inner.clone();
        let discovery: Arc<dyn DiscoveryObserver> = self.inner.clone();
        self.inner.transport.start_advertising(lifecycle).await?;
        self.inner.transport.start_discovery(discovery).await?;

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = inner.ctx.config.rediscovery_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.sweep_idle().await;
                        let observer: Arc<dyn DiscoveryObserver> = inner.clone();
                        if let Err(e) = inner.transport.start_discovery(observer).await {
                            debug!("re-arming discovery failed: {e}");
                        }
                        inner.try_connect().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(())
    }

    /// Terminal: cancel the timer, close every pipe, stop the transport.
    /// The watcher is not reusable afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(own = %self.inner.ctx.own_id, "stopping neighborhood watcher");
        let _ = self.shutdown.send(());
        let pipes: Vec<Arc<Pipe>> = self
            .inner
            .pipes
            .lock()
            .expect("watcher lock poisoned")
            .drain()
            .map(|(_, p)| p)
            .collect();
        for pipe in pipes {
            pipe.close().await;
        }
        self.inner.transport.stop_discovery().await;
        self.inner.transport.stop_advertising().await;
        self.inner.transport.close().await;
    }

    /// Currently visible neighbors, as recorded by discovery.
    pub fn known_neighbors(&self) -> Vec<Neighbor> {
        self.inner
            .neighbors
            .lock()
            .expect("watcher lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl WatcherInner {
    /// Whether a session or connection attempt is already in flight.
    fn busy(&self) -> bool {
        let mut pipes = self.pipes.lock().expect("watcher lock poisoned");
        pipes.retain(|_, p| !p.is_closed());
        if !pipes.is_empty() {
            return true;
        }
        self.connecting
            .lock()
            .expect("watcher lock poisoned")
            .is_some()
    }

    /// Pick one eligible neighbor and request a connection. A neighbor
    /// is eligible when its id sorts greater than the own id; lesser
    /// ids wait to be connected to instead.
    async fn try_connect(&self) {
        if self.busy() {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let own_id = &self.ctx.own_id;
        let candidate = {
            let neighbors = self.neighbors.lock().expect("watcher lock poisoned");
            let eligible: Vec<&Neighbor> =
                neighbors.values().filter(|n| n.id > *own_id).collect();
            eligible.choose(&mut rand::thread_rng()).map(|n| (*n).clone())
        };
        let Some(neighbor) = candidate else {
            return;
        };
        {
            let mut connecting = self.connecting.lock().expect("watcher lock poisoned");
            if connecting.is_some() {
                return;
            }
            *connecting = Some(neighbor.id.clone());
        }
        info!(own = %own_id, neighbor = %neighbor, "requesting connection");
        let lifecycle: Arc<dyn ConnectionLifecycle> = this;
        if let Err(e) = self.transport.request_connection(&neighbor, lifecycle).await {
            warn!(neighbor = %neighbor, "connection request failed: {e}");
            *self.connecting.lock().expect("watcher lock poisoned") = None;
        }
    }

    /// Close pipes with no payload activity for longer than the idle
    /// timeout.
    async fn sweep_idle(&self) {
        let cutoff = chrono::Utc::now().timestamp_millis()
            - self.ctx.config.idle_timeout.as_millis() as i64;
        let stale: Vec<Arc<Pipe>> = {
            let mut pipes = self.pipes.lock().expect("watcher lock poisoned");
            let ids: Vec<PeerId> = pipes
                .iter()
                .filter(|(_, p)| p.last_interaction_ms() < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pipes.remove(id)).collect()
        };
        for pipe in stale {
            info!(neighbor = %pipe.neighbor(), "disconnecting idle neighbor");
            pipe.close().await;
        }
    }

    fn clear_connecting(&self, id: &PeerId) {
        let mut connecting = self.connecting.lock().expect("watcher lock poisoned");
        if connecting.as_ref() == Some(id) {
            *connecting = None;
        }
    }
}

#[async_trait]
impl DiscoveryObserver for WatcherInner {
    async fn on_neighbor_found(&self, neighbor: Neighbor) {
        debug!(own = %self.ctx.own_id, neighbor = %neighbor, "neighbor found");
        self.neighbors
            .lock()
            .expect("watcher lock poisoned")
            .insert(neighbor.id.clone(), neighbor);
        self.try_connect().await;
    }

    async fn on_neighbor_lost(&self, neighbor: Neighbor) {
        debug!(own = %self.ctx.own_id, neighbor = %neighbor, "neighbor lost");
        self.neighbors
            .lock()
            .expect("watcher lock poisoned")
            .remove(&neighbor.id);
    }
}

#[async_trait]
impl ConnectionLifecycle for WatcherInner {
    async fn on_connection_initiated(&self, neighbor: &Neighbor) {
        info!(own = %self.ctx.own_id, neighbor = %neighbor, "connection initiated");
        let sink = Arc::new(TransportSink::new(self.transport.clone(), neighbor.clone()));
        let pipe = Pipe::new(self.ctx.own_id.clone(), neighbor.clone(), sink);
        self.pipes
            .lock()
            .expect("watcher lock poisoned")
            .insert(neighbor.id.clone(), pipe.clone());

        let payloads = Arc::new(PipePayloadObserver::new(pipe));
        if let Err(e) = self.transport.accept_connection(neighbor, payloads).await {
            warn!(neighbor = %neighbor, "accepting connection failed: {e}");
            self.pipes
                .lock()
                .expect("watcher lock poisoned")
                .remove(&neighbor.id);
        }
    }

    async fn on_connection_result(&self, neighbor: &Neighbor, result: Result<(), String>) {
        self.clear_connecting(&neighbor.id);
        match result {
            Ok(()) => {
                info!(own = %self.ctx.own_id, neighbor = %neighbor, "connection established");
                let pipe = self
                    .pipes
                    .lock()
                    .expect("watcher lock poisoned")
                    .get(&neighbor.id)
                    .cloned();
                match pipe {
                    Some(pipe) => self.chooser.start_session(self.ctx.own_id.clone(), pipe),
                    None => warn!(neighbor = %neighbor, "connection result without a pipe"),
                }
            }
            Err(reason) => {
                warn!(neighbor = %neighbor, "connection failed: {reason}");
                let pipe = self
                    .pipes
                    .lock()
                    .expect("watcher lock poisoned")
                    .remove(&neighbor.id);
                if let Some(pipe) = pipe {
                    pipe.close().await;
                }
            }
        }
    }

    async fn on_disconnected(&self, neighbor: &Neighbor) {
        info!(own = %self.ctx.own_id, neighbor = %neighbor, "disconnected");
        self.clear_connecting(&neighbor.id);
        let pipe = self
            .pipes
            .lock()
            .expect("watcher lock poisoned")
            .remove(&neighbor.id);
        if let Some(pipe) = pipe {
            pipe.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
