use std::sync::atomic::{AtomicU64, Ordering};

use neptune_metrics::{Counter, Ewma};
use serde::{Deserialize, Serialize};

/// Live per-transport statistics. Updated concurrently from send and
/// receive paths; read through [`TransportMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct TransportMetrics {
    messages_sent: Counter,
    messages_received: Counter,
    bytes_sent: Counter,
    bytes_received: Counter,
    errors: Counter,
    /// Unix seconds of the last successful start, 0 if never started.
    start_time: AtomicU64,
    avg_rtt_ms: Ewma,
}

/// Point-in-time copy of [`TransportMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub start_time: Option<u64>,
    pub avg_rtt_ms: f64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.inc();
        self.bytes_sent.add(bytes as u64);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.inc();
        self.bytes_received.add(bytes as u64);
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    /// Fold a round-trip sample into the moving average.
    pub fn record_rtt(&self, rtt_ms: f64) -> f64 {
        self.avg_rtt_ms.record(rtt_ms)
    }

    /// Force the average, e.g. from a link-layer measurement.
    pub fn set_rtt(&self, rtt_ms: f64) {
        self.avg_rtt_ms.set(rtt_ms);
    }

    pub fn avg_rtt_ms(&self) -> f64 {
        self.avg_rtt_ms.get()
    }

    pub(crate) fn mark_started(&self) {
        self.start_time.store(crate::now_secs(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.messages_sent.reset();
        self.messages_received.reset();
        self.bytes_sent.reset();
        self.bytes_received.reset();
        self.errors.reset();
        self.avg_rtt_ms.reset();
        self.start_time.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let start = self.start_time.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: self.messages_sent.get(),
            messages_received: self.messages_received.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            errors: self.errors.get(),
            start_time: (start > 0).then_some(start),
            avg_rtt_ms: self.avg_rtt_ms.get(),
        }
    }
}
