//! Neptune relay protocol.
//!
//! Builds on `neptune-transport`: a message bus between nodes (in-process
//! or RabbitMQ), the dispatcher that turns send requests into bus traffic
//! and routes what comes back, and the hop/loop policy for forwarding.
//!
//! Bus transit: JSON, XChaCha20-Poly1305 under a per-deployment key.
//! Local deliveries: sealed to the recipient's Ed25519 key, signed by the node.

pub mod bus;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod relay;
pub mod store;

pub use bus::{
    connect_bus, BusContext, BusEndpoint, BusHandler, BusMessage, InternalBus, MessageBus,
    RabbitMqBus, DEFAULT_QUEUE,
};
pub use crypto::{CryptoProvider, NodeCrypto, SealedPayload};
pub use dispatcher::{
    ChannelFanout, Dispatcher, DispatcherConfig, OutgoingMessage, RelayHandler, RelayOutcome,
    DEFAULT_DEDUP_CAPACITY,
};
pub use error::ProtocolError;
pub use relay::{history_entry, prepare_forward, DropReason};
pub use store::{DeliveryRecord, MemoryStore, MessageStore, UserRecord};
