//! In-memory transport for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::peer::PeerInfo;
use crate::transport::{Transport, TransportCore, TransportKind};

/// Scriptable transport: records what it sends, can be told to fail at
/// any lifecycle step, and lets tests pin its RTT.
pub struct MockTransport {
    core: TransportCore,
    sent: Arc<Mutex<Vec<Envelope>>>,
    peers: Mutex<Vec<PeerInfo>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_send: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(id: &str) -> Self {
        Self::with_kind(id, TransportKind::Custom("mock".into()))
    }

    pub fn with_kind(id: &str, kind: TransportKind) -> Self {
        Self {
            core: TransportCore::new(id, kind),
            sent: Arc::new(Mutex::new(Vec::new())),
            peers: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            start_delay: Mutex::new(None),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_rtt(&self, rtt_ms: f64) {
        self.core.metrics().set_rtt(rtt_ms);
    }

    pub fn add_peer(&self, peer: PeerInfo) {
        self.peers.lock().unwrap().push(peer);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Simulate an inbound message arriving on this transport.
    pub async fn inject(&self, envelope: Envelope) {
        let size = envelope.to_json().map(|j| j.len()).unwrap_or(0);
        self.core.deliver(envelope, size).await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn on_start(&self, _cancel: CancellationToken) -> Result<(), TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::Start {
                transport_id: self.core.id().to_owned(),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), TransportError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(TransportError::Stop {
                transport_id: self.core.id().to_owned(),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }

    async fn transmit(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send {
                message_id: envelope.header.message_id.clone(),
                reason: "scripted failure".into(),
            });
        }
        let size = envelope.to_json()?.len();
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(size)
    }

    async fn discover_peers(&self) -> Result<Vec<PeerInfo>, TransportError> {
        Ok(self.peers.lock().unwrap().clone())
    }
}
