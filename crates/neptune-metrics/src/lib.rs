//! Lock-free statistics for Neptune transports.
//!
//! [`Counter`] is a monotonic event count; [`Ewma`] tracks a smoothed
//! sample stream (round-trip times). Both serialize as their plain
//! current value so snapshots can be logged or shipped as JSON.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smoothing weight given to the previous average.
pub const EWMA_DECAY: f64 = 0.9;

// ── Counter ────────────────────────────────────────────────────────────

/// Monotonic event counter. Relaxed ordering: values are statistics only.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Back to zero. Only used when a whole metrics block is reset.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.get()))
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", self.get())
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

impl<'de> serde::Deserialize<'de> for Counter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self(AtomicU64::new(value)))
    }
}

// ── Ewma ───────────────────────────────────────────────────────────────

/// Exponentially weighted moving average over `f64` samples.
///
/// The value is kept as raw bits in an [`AtomicU64`] and updated with a
/// compare-and-swap loop, so concurrent recorders never lose a sample.
/// While the average is non-positive the next sample replaces it outright;
/// afterwards each sample contributes `1 - EWMA_DECAY` of the new value.
pub struct Ewma(AtomicU64);

impl Ewma {
    pub fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    /// Fold one sample into the average and return the new value.
    pub fn record(&self, sample: f64) -> f64 {
        let mut next = sample;
        // fetch_update only fails when the closure returns None.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let old = f64::from_bits(bits);
                next = if old <= 0.0 {
                    sample
                } else {
                    EWMA_DECAY * old + (1.0 - EWMA_DECAY) * sample
                };
                Some(next.to_bits())
            });
        next
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Overwrite the average. Used by tests and by transports that learn
    /// their latency out of band.
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Ewma {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.0.load(Ordering::Relaxed)))
    }
}

impl fmt::Debug for Ewma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ewma").field(&self.get()).finish()
    }
}

impl serde::Serialize for Ewma {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.get())
    }
}

impl<'de> serde::Deserialize<'de> for Ewma {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <f64 as serde::Deserialize>::deserialize(deserializer)?;
        let ewma = Self::new();
        ewma.set(value);
        Ok(ewma)
    }
}
