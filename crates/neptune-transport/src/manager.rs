//! Registry of transports with coordinated lifecycle and routed sends.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::peer::PeerInfo;
use crate::strategy::RoutingStrategy;
use crate::transport::{EventSink, Transport, TransportEvent};

/// Capacity of the fan-in event stream.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Owns the registered transports, in registration order.
///
/// Every transport pushes into one shared event stream whose receiver is
/// handed out once, by [`TransportManager::new`].
pub struct TransportManager {
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    strategy: Arc<dyn RoutingStrategy>,
    events: mpsc::Sender<TransportEvent>,
}

impl TransportManager {
    pub fn new(
        strategy: impl RoutingStrategy + 'static,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        Self::with_event_buffer(strategy, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(
        strategy: impl RoutingStrategy + 'static,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let manager = Self {
            transports: RwLock::new(Vec::new()),
            strategy: Arc::new(strategy),
            events,
        };
        (manager, rx)
    }

    /// Register and subscribe. Returns `false` (and logs) if the id is
    /// already registered; the existing transport is kept.
    pub async fn add(&self, transport: Arc<dyn Transport>) -> bool {
        let mut transports = self.transports.write().await;
        if transports.iter().any(|t| t.id() == transport.id()) {
            warn!(transport_id = %transport.id(), "transport already registered, ignoring");
            return false;
        }
        transport.attach(EventSink::new(self.events.clone()));
        info!(transport_id = %transport.id(), kind = %transport.kind(), "transport registered");
        transports.push(transport);
        true
    }

    /// Unregister and unsubscribe. The transport is returned as is; stopping
    /// it is up to the caller.
    pub async fn remove(&self, id: &str) -> Option<Arc<dyn Transport>> {
        let mut transports = self.transports.write().await;
        let pos = transports.iter().position(|t| t.id() == id)?;
        let transport = transports.remove(pos);
        transport.detach();
        info!(transport_id = %id, "transport removed");
        Some(transport)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().await.iter().find(|t| t.id() == id).cloned()
    }

    pub async fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.read().await.clone()
    }

    pub async fn active(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .await
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.transports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transports.read().await.is_empty()
    }

    /// Start every transport concurrently and wait for all of them.
    /// Failures are logged per transport; returns how many are active.
    pub async fn start_all(&self) -> usize {
        let results = run_all(self.transports().await, |t| async move { t.start().await }).await;
        let mut started = 0;
        for (id, result) in results {
            match result {
                Ok(()) => started += 1,
                Err(e) => warn!(transport_id = %id, "start failed: {e}"),
            }
        }
        info!(started, "transports started");
        started
    }

    /// Stop every transport concurrently and wait for all of them.
    pub async fn stop_all(&self) {
        let results = run_all(self.transports().await, |t| async move { t.stop().await }).await;
        for (id, result) in results {
            if let Err(e) = result {
                warn!(transport_id = %id, "stop reported an error: {e}");
            }
        }
        info!("transports stopped");
    }

    /// Route through the strategy. `false` means no transport could take it.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let active = self.active().await;
        if active.is_empty() {
            warn!(message_id = %envelope.header.message_id, "no active transport");
            return false;
        }
        let Some(transport) = self.strategy.select(envelope, &active) else {
            warn!(message_id = %envelope.header.message_id, "strategy selected no transport");
            return false;
        };
        debug!(
            message_id = %envelope.header.message_id,
            transport_id = %transport.id(),
            "sending"
        );
        transport.send(envelope).await
    }

    /// Ask every active transport for its neighbours and merge sightings
    /// of the same node.
    pub async fn discover_peers(&self) -> Vec<PeerInfo> {
        let results =
            run_all(self.active().await, |t| async move { t.discover_peers().await }).await;
        let mut merged: BTreeMap<String, PeerInfo> = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(peers) => {
                    for peer in peers {
                        match merged.get_mut(&peer.node_id) {
                            Some(known) => known.merge(peer),
                            None => {
                                merged.insert(peer.node_id.clone(), peer);
                            }
                        }
                    }
                }
                Err(e) => warn!(transport_id = %id, "peer discovery failed: {e}"),
            }
        }
        merged.into_values().collect()
    }
}

/// Run `op` on every transport in its own task and collect all outcomes.
/// A panicking task is logged and left out of the results.
async fn run_all<T, F, Fut>(
    transports: Vec<Arc<dyn Transport>>,
    op: F,
) -> Vec<(String, Result<T, TransportError>)>
where
    T: Send + 'static,
    F: Fn(Arc<dyn Transport>) -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for t in transports {
        let id = t.id().to_owned();
        let fut = op(t);
        set.spawn(async move { (id, fut.await) });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => results.push(outcome),
            Err(e) => warn!("transport task aborted: {e}"),
        }
    }
    results
}
