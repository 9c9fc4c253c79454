//! Inter-node message bus.
//!
//! The dispatcher publishes transit-encrypted messages here; a consume loop
//! hands every received item to the registered [`BusHandler`]. The backend
//! is chosen from a connection string by [`connect_bus`].

mod endpoint;
mod internal;
mod rabbitmq;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;

pub use endpoint::{BusEndpoint, DEFAULT_QUEUE};
pub use internal::InternalBus;
pub use rabbitmq::{decode_delivery, encode_publish, RabbitMqBus};

/// One item on the bus. `payload` is already transit-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub message_id: String,
    /// Node that published the message.
    pub source_node: String,
    pub payload: String,
}

/// Receives every item the bus consumes.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, message: BusMessage);
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    fn endpoint(&self) -> &BusEndpoint;

    /// Install the consumer callback. Replaces any previous handler.
    fn set_handler(&self, handler: Arc<dyn BusHandler>);

    /// Connect and start the consume loop. No-op when already running.
    async fn start(&self) -> Result<(), ProtocolError>;

    async fn stop(&self) -> Result<(), ProtocolError>;

    /// Hand `message` to the bus. Returns once the bus has accepted it;
    /// delivery to the consumer is not awaited.
    async fn publish(&self, message: BusMessage) -> Result<(), ProtocolError>;
}

/// What a broker-backed bus needs to wrap and unwrap messages.
#[derive(Clone)]
pub struct BusContext {
    pub node_name: String,
    pub shared_key: String,
    pub crypto: Arc<dyn CryptoProvider>,
}

/// Build the bus named by `connection`. Unknown schemes and malformed URLs
/// fail here, before anything is started.
pub fn connect_bus(
    connection: &str,
    ctx: BusContext,
) -> Result<Arc<dyn MessageBus>, ProtocolError> {
    let endpoint = BusEndpoint::parse(connection)?;
    let bus: Arc<dyn MessageBus> = match &endpoint {
        BusEndpoint::Internal { .. } => Arc::new(InternalBus::new(endpoint)),
        BusEndpoint::RabbitMq { .. } => Arc::new(RabbitMqBus::new(endpoint, ctx)?),
    };
    tracing::info!(bus = %bus.endpoint(), "message bus configured");
    Ok(bus)
}
