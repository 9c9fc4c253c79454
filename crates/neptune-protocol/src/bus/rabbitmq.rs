//! RabbitMQ-backed bus.
//!
//! The queue is declared durable, non-exclusive and non-auto-delete.
//! Consumption is auto-ack: the broker forgets an item once it is handed
//! to us, so delivery is at most once. Items that fail to decode or
//! decrypt are logged and dropped; the loop keeps going. If the broker
//! ends the consumer stream the bus reports itself dead: publishing fails
//! until it is stopped and started again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_lite::{Stream, StreamExt};
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::message::Delivery;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusContext, BusEndpoint, BusHandler, BusMessage, MessageBus};
use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;

/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

type HandlerSlot = Arc<RwLock<Option<Arc<dyn BusHandler>>>>;

struct Session {
    connection: Connection,
    channel: Channel,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

pub struct RabbitMqBus {
    endpoint: BusEndpoint,
    queue: String,
    ctx: BusContext,
    handler: HandlerSlot,
    session: tokio::sync::Mutex<Option<Session>>,
    consuming: Arc<AtomicBool>,
}

impl RabbitMqBus {
    /// Nothing is contacted until [`start`](MessageBus::start).
    pub fn new(endpoint: BusEndpoint, ctx: BusContext) -> Result<Self, ProtocolError> {
        let queue = match &endpoint {
            BusEndpoint::RabbitMq { queue, .. } => queue.clone(),
            other => {
                return Err(ProtocolError::Config(format!(
                    "{other} is not a rabbitmq endpoint"
                )))
            }
        };
        if ctx.shared_key.is_empty() {
            return Err(ProtocolError::Config("rabbitmq bus needs a shared key".into()));
        }
        Ok(Self {
            endpoint,
            queue,
            ctx,
            handler: Arc::new(RwLock::new(None)),
            session: tokio::sync::Mutex::new(None),
            consuming: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// `false` before start, after stop, and once the broker has ended
    /// the consumer stream.
    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    fn ensure_consuming(&self) -> Result<(), ProtocolError> {
        if self.is_consuming() {
            return Ok(());
        }
        Err(ProtocolError::Bus("rabbitmq consumer is gone, restart the bus".into()))
    }
}

/// Body published to the broker: the message tagged with its source node,
/// as JSON, transit-encrypted.
pub fn encode_publish(
    message: &BusMessage,
    crypto: &dyn CryptoProvider,
    shared_key: &str,
) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_string(message)?;
    Ok(crypto.encrypt_string(&json, shared_key)?.into_bytes())
}

/// Inverse of [`encode_publish`].
pub fn decode_delivery(
    body: &[u8],
    crypto: &dyn CryptoProvider,
    shared_key: &str,
) -> Result<BusMessage, ProtocolError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ProtocolError::Deserialization("delivery body is not utf-8".into()))?;
    let json = crypto.decrypt_string(text, shared_key)?;
    Ok(serde_json::from_str(&json)?)
}

async fn consume<S>(
    mut consumer: S,
    ctx: BusContext,
    handler: HandlerSlot,
    consuming: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Delivery, lapin::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = consumer.next() => next,
        };
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                warn!("rabbitmq consumer error: {e}");
                continue;
            }
            None => {
                consuming.store(false, Ordering::SeqCst);
                error!("rabbitmq consumer stream ended, bus no longer receives");
                break;
            }
        };

        let decoded = decode_delivery(&delivery.data, ctx.crypto.as_ref(), &ctx.shared_key);
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(bytes = delivery.data.len(), "dropping undecodable delivery: {e}");
                continue;
            }
        };

        let current = handler.read().unwrap_or_else(|p| p.into_inner()).clone();
        match current {
            Some(h) => {
                tokio::spawn(async move { h.handle(message).await });
            }
            None => warn!(message_id = %message.message_id, "no bus handler, dropping message"),
        }
    }
    debug!("rabbitmq consume loop finished");
}

#[async_trait]
impl MessageBus for RabbitMqBus {
    fn endpoint(&self) -> &BusEndpoint {
        &self.endpoint
    }

    fn set_handler(&self, handler: Arc<dyn BusHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let uri = self
            .endpoint
            .amqp_uri()
            .ok_or_else(|| ProtocolError::Config("not a broker endpoint".into()))?;

        let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("neptune-{}", self.ctx.node_name);
        let consumer = channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let cancel = CancellationToken::new();
        self.consuming.store(true, Ordering::SeqCst);
        let task = tokio::spawn(consume(
            consumer,
            self.ctx.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.consuming),
            cancel.clone(),
        ));
        *session = Some(Session {
            connection,
            channel,
            cancel,
            consumer: task,
        });
        info!(bus = %self.endpoint, queue = %self.queue, "rabbitmq bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.cancel.cancel();
        self.consuming.store(false, Ordering::SeqCst);
        if let Err(e) = session.consumer.await {
            warn!("rabbitmq consume task failed: {e}");
        }
        // Close both even if the first fails; report the first error.
        let channel = session.channel.close(200, "neptune shutdown").await;
        let connection = session.connection.close(200, "neptune shutdown").await;
        info!(bus = %self.endpoint, "rabbitmq bus stopped");
        channel?;
        connection?;
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> Result<(), ProtocolError> {
        let body = encode_publish(&message, self.ctx.crypto.as_ref(), &self.ctx.shared_key)?;
        // Channels are cheap handles; the lock is not held across the confirm.
        let channel = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or_else(|| ProtocolError::Bus("rabbitmq bus is not started".into()))?;
        self.ensure_consuming()?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("text/plain".into()),
            )
            .await?
            .await?;
        debug!(message_id = %message.message_id, queue = %self.queue, "published to rabbitmq");
        Ok(())
    }
}
