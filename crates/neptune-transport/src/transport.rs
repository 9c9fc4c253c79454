//! Transport contract and the lifecycle core every transport embeds.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::peer::PeerInfo;

// ── Kinds and states ───────────────────────────────────────────────────

/// Physical medium behind a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Udp,
    Bluetooth,
    LoRa,
    Custom(String),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Bluetooth => f.write_str("bluetooth"),
            TransportKind::LoRa => f.write_str("lora"),
            TransportKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Lifecycle: `Stopped → Starting → Active → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    #[default]
    Stopped,
    Starting,
    Active,
    Stopping,
}

// ── Events ─────────────────────────────────────────────────────────────

/// Everything a transport pushes upward. Each event names its source.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MessageReceived { transport_id: String, envelope: Envelope },
    PeerDiscovered { transport_id: String, peer: PeerInfo },
    StatusChanged { transport_id: String, status: TransportStatus },
}

impl TransportEvent {
    pub fn transport_id(&self) -> &str {
        match self {
            TransportEvent::MessageReceived { transport_id, .. }
            | TransportEvent::PeerDiscovered { transport_id, .. }
            | TransportEvent::StatusChanged { transport_id, .. } => transport_id,
        }
    }
}

/// Producer half of the manager's single event stream.
#[derive(Debug, Clone)]
pub struct EventSink(mpsc::Sender<TransportEvent>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<TransportEvent>) -> Self {
        Self(tx)
    }

    /// Inbound messages wait for room: dropping them would lose traffic.
    async fn message(&self, event: TransportEvent) -> bool {
        self.0.send(event).await.is_ok()
    }

    /// Status and peer notices are advisory and never block a transport.
    fn notice(&self, event: TransportEvent) {
        if let Err(e) = self.0.try_send(event) {
            debug!("transport notice dropped: {e}");
        }
    }
}

// ── Core ───────────────────────────────────────────────────────────────

/// State shared by all transports: identity, lifecycle, cancellation,
/// counters and the attached event sink.
pub struct TransportCore {
    id: String,
    kind: TransportKind,
    status: Mutex<TransportStatus>,
    // Serializes start/stop so a stop issued mid-start waits for it.
    lifecycle: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    metrics: TransportMetrics,
    sink: Mutex<Option<EventSink>>,
}

impl TransportCore {
    pub fn new(id: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: Mutex::new(TransportStatus::Stopped),
            lifecycle: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            metrics: TransportMetrics::new(),
            sink: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TransportKind {
        &self.kind
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransportStatus::Active
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Token of the current run. Cancelled when the transport stops.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_status(&self, status: TransportStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
        if let Some(sink) = self.sink() {
            sink.notice(TransportEvent::StatusChanged {
                transport_id: self.id.clone(),
                status,
            });
        }
    }

    fn sink(&self) -> Option<EventSink> {
        self.sink.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    pub fn detach(&self) {
        self.sink.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    /// Run `init` with a fresh cancellation token. No-op when already
    /// starting or active. On failure the token is cancelled, the
    /// transport is back to `Stopped` and the error is returned.
    pub async fn start_with<F, Fut>(&self, init: F) -> Result<(), TransportError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let _guard = self.lifecycle.lock().await;
        if matches!(self.status(), TransportStatus::Starting | TransportStatus::Active) {
            return Ok(());
        }

        self.set_status(TransportStatus::Starting);
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();

        match init(token.clone()).await {
            Ok(()) => {
                self.metrics.mark_started();
                self.set_status(TransportStatus::Active);
                info!(transport_id = %self.id, kind = %self.kind, "transport started");
                Ok(())
            }
            Err(e) => {
                token.cancel();
                self.set_status(TransportStatus::Stopped);
                warn!(transport_id = %self.id, "transport failed to start: {e}");
                Err(e)
            }
        }
    }

    /// Cancel background work, then run `shutdown`. The transport always
    /// ends `Stopped`; a shutdown error is returned after that.
    pub async fn stop_with<F, Fut>(&self, shutdown: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let _guard = self.lifecycle.lock().await;
        if matches!(self.status(), TransportStatus::Stopped | TransportStatus::Stopping) {
            return Ok(());
        }

        self.set_status(TransportStatus::Stopping);
        self.cancel_token().cancel();
        let result = shutdown().await;
        self.set_status(TransportStatus::Stopped);

        match &result {
            Ok(()) => info!(transport_id = %self.id, "transport stopped"),
            Err(e) => warn!(transport_id = %self.id, "transport stopped with error: {e}"),
        }
        result
    }

    /// Count an inbound message, then publish it. Waiting for room in a
    /// full event stream is abandoned once the transport is stopping.
    pub async fn deliver(&self, envelope: Envelope, wire_bytes: usize) {
        self.metrics.record_received(wire_bytes);
        let Some(sink) = self.sink() else {
            debug!(transport_id = %self.id, "inbound message with no subscriber");
            return;
        };
        let cancel = self.cancel_token();
        let event = TransportEvent::MessageReceived {
            transport_id: self.id.clone(),
            envelope,
        };
        tokio::select! {
            biased;
            delivered = sink.message(event) => {
                if !delivered {
                    debug!(transport_id = %self.id, "event stream closed");
                }
            }
            _ = cancel.cancelled() => {
                debug!(transport_id = %self.id, "stopping, inbound message dropped");
            }
        }
    }

    pub fn announce_peer(&self, peer: PeerInfo) {
        if let Some(sink) = self.sink() {
            sink.notice(TransportEvent::PeerDiscovered {
                transport_id: self.id.clone(),
                peer,
            });
        }
    }
}

impl fmt::Debug for TransportCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

// ── Trait ──────────────────────────────────────────────────────────────

/// One pluggable delivery channel.
///
/// Implementors embed a [`TransportCore`] and supply the medium-specific
/// hooks; lifecycle, metrics and event plumbing come from the provided
/// methods.
#[async_trait]
pub trait Transport: Send + Sync {
    fn core(&self) -> &TransportCore;

    /// Bring the medium up. Background tasks must stop when `cancel` fires.
    async fn on_start(&self, cancel: CancellationToken) -> Result<(), TransportError>;

    /// Release the medium. Called after the token has been cancelled.
    async fn on_stop(&self) -> Result<(), TransportError>;

    /// Hand one envelope to the medium. Returns the bytes written; a
    /// partial write is an error.
    async fn transmit(&self, envelope: &Envelope) -> Result<usize, TransportError>;

    /// Best-effort, unordered list of currently known neighbours.
    async fn discover_peers(&self) -> Result<Vec<PeerInfo>, TransportError>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn kind(&self) -> TransportKind {
        self.core().kind().clone()
    }

    fn status(&self) -> TransportStatus {
        self.core().status()
    }

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.core().metrics().snapshot()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.core().start_with(|cancel| self.on_start(cancel)).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.core().stop_with(|| self.on_stop()).await
    }

    /// Send one envelope. `false` when inactive or the medium refused it.
    async fn send(&self, envelope: &Envelope) -> bool {
        let core = self.core();
        if !core.is_active() {
            debug!(transport_id = %core.id(), "send on inactive transport");
            return false;
        }
        match self.transmit(envelope).await {
            Ok(bytes) => {
                core.metrics().record_sent(bytes);
                true
            }
            Err(e) => {
                core.metrics().record_error();
                warn!(
                    transport_id = %core.id(),
                    message_id = %envelope.header.message_id,
                    "send failed: {e}"
                );
                false
            }
        }
    }

    fn attach(&self, sink: EventSink) {
        self.core().attach(sink);
    }

    fn detach(&self) {
        self.core().detach();
    }
}
