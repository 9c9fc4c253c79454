//! Neptune transport layer.
//!
//! Message model, pluggable transports with a shared lifecycle core, a
//! routing strategy and the [`TransportManager`] that ties them together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use neptune_transport::{
//!     DefaultRoutingStrategy, Envelope, MessageType, TransportManager, UdpTransport,
//!     UdpTransportConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (manager, mut events) = TransportManager::new(DefaultRoutingStrategy);
//! manager.add(Arc::new(UdpTransport::new(UdpTransportConfig::new("udp-0")))).await;
//! manager.start_all().await;
//!
//! let hello = Envelope::builder("alice@node-1", MessageType::Privmsg)
//!     .recipient("bob@node-2")
//!     .text("hello")
//!     .build();
//! manager.send(&hello).await;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} -> {:?}", event.transport_id(), event);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod envelope;
mod error;
mod identity;
mod manager;
mod metrics;
mod peer;
mod strategy;
mod transport;
mod udp;
mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use config::{TransportOptions, UdpTransportConfig, DEFAULT_UDP_PORT, MAX_UDP_PAYLOAD};
pub use envelope::{
    CryptoInfo, EncryptionType, Envelope, EnvelopeBuilder, Header, MessageType, Payload,
    PayloadFormat, Routing, ENVELOPE_VERSION,
};
pub use error::TransportError;
pub use identity::{
    format_id, is_channel_address, is_valid_channel_name, require_channel_name, NeptuneId,
    CHANNEL_SIGIL, MAX_CHANNEL_LEN,
};
pub use manager::{TransportManager, DEFAULT_EVENT_BUFFER};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use peer::{ConnectionType, EndpointInfo, PeerInfo};
pub use strategy::{DefaultRoutingStrategy, RoutingStrategy};
pub use transport::{
    EventSink, Transport, TransportCore, TransportEvent, TransportKind, TransportStatus,
};
pub use udp::UdpTransport;
pub use wire::{
    RelayMessage, DEFAULT_MAX_HOPS, FRAME_HEADER_LEN, FRAME_MAGIC, META_HISTORY, META_HOPS,
    META_MAX_HOPS,
};

/// Current time as unix seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
