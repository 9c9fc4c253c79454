//! Wires transports, bus and dispatcher into a running relay node.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use neptune_protocol::{
    connect_bus, BusContext, DeliveryRecord, Dispatcher, MemoryStore, MessageBus, MessageStore,
};
use neptune_transport::{
    DefaultRoutingStrategy, Transport, TransportEvent, TransportManager, UdpTransport,
};

use crate::config::NodeConfig;

pub struct RelayNode {
    name: String,
    manager: Arc<TransportManager>,
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryStore>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    cancel: CancellationToken,
    event_loop: Option<JoinHandle<()>>,
}

impl RelayNode {
    /// Build every component from `config`. Nothing is started yet.
    pub async fn build(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let crypto = Arc::new(config.crypto()?);
        info!(node = %config.node_name, public_key = %crypto.public_key_hex(), "node identity");

        let store = Arc::new(MemoryStore::new());
        for user in &config.users {
            store.add_user(user.username.clone(), user.public_key.clone()).await;
        }

        let (manager, events) = TransportManager::new(DefaultRoutingStrategy);
        let manager = Arc::new(manager);
        for entry in &config.transports {
            let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(entry.udp_config()?));
            manager.add(transport).await;
        }

        let bus = connect_bus(
            &config.bus_url(),
            BusContext {
                node_name: config.node_name.clone(),
                shared_key: config.shared_key.clone(),
                crypto: crypto.clone(),
            },
        )?;
        let dispatcher = Dispatcher::new(
            config.dispatcher_config(),
            crypto,
            store.clone(),
            manager.clone(),
            bus.clone(),
        )?;

        Ok(Self {
            name: config.node_name.clone(),
            manager,
            bus,
            dispatcher: Arc::new(dispatcher),
            store,
            events: Some(events),
            cancel: CancellationToken::new(),
            event_loop: None,
        })
    }

    #[cfg(test)]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Start transports, the bus consumer and the transport event loop.
    pub async fn start(&mut self) -> Result<()> {
        let configured = self.manager.len().await;
        let started = self.manager.start_all().await;
        if started < configured {
            warn!(started, configured, "some transports failed to start");
        }
        self.bus.start().await.context("starting message bus")?;

        if let Some(events) = self.events.take() {
            self.event_loop = Some(tokio::spawn(drain_events(
                events,
                self.dispatcher.clone(),
                self.cancel.clone(),
            )));
        }
        info!(node = %self.name, transports = started, bus = %self.bus.endpoint(), "node running");
        Ok(())
    }

    /// Stop everything started by [`start`](Self::start). Every step runs
    /// even when an earlier one fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.event_loop.take() {
            if let Err(e) = task.await {
                warn!("event loop task failed: {e}");
            }
        }
        let bus = self.bus.stop().await;
        self.manager.stop_all().await;

        // In-memory inboxes do not survive the process.
        match self.store.query_deliveries(&|r: &DeliveryRecord| !r.read).await {
            Ok(unread) if !unread.is_empty() => {
                let unread = unread.len();
                warn!(node = %self.name, unread, "discarding undelivered inbox records")
            }
            Ok(_) => {}
            Err(e) => warn!("inbox scan failed: {e}"),
        }
        info!(node = %self.name, "node stopped");
        bus.context("stopping message bus")
    }

    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.start().await?;
        shutdown.await;
        self.shutdown().await
    }
}

/// Single consumer of the manager's event stream.
async fn drain_events(
    mut events: mpsc::Receiver<TransportEvent>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::MessageReceived { transport_id, envelope } => {
                debug!(%transport_id, message_id = %envelope.message_id(), "inbound relay message");
                // Outcome and failures are logged by the dispatcher.
                let _ = dispatcher.on_transport_message(&envelope).await;
            }
            TransportEvent::PeerDiscovered { transport_id, peer } => {
                info!(
                    %transport_id,
                    node = %peer.node_id,
                    endpoint = %peer.endpoint,
                    "peer discovered"
                );
            }
            TransportEvent::StatusChanged { transport_id, status } => {
                debug!(%transport_id, ?status, "transport status changed");
            }
        }
    }
    debug!("transport event loop finished");
}
