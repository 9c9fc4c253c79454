use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusEndpoint, BusHandler, BusMessage, MessageBus};
use crate::error::ProtocolError;

type Queue = mpsc::UnboundedReceiver<BusMessage>;

/// In-process bus. Messages never leave this process.
///
/// Items published before [`start`](MessageBus::start) wait in the queue
/// and are consumed once the loop runs; the queue survives a stop/start.
pub struct InternalBus {
    endpoint: BusEndpoint,
    tx: mpsc::UnboundedSender<BusMessage>,
    queue: Mutex<Option<Queue>>,
    handler: Arc<RwLock<Option<Arc<dyn BusHandler>>>>,
    running: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<Queue>)>>,
}

impl InternalBus {
    pub fn new(endpoint: BusEndpoint) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            tx,
            queue: Mutex::new(Some(rx)),
            handler: Arc::new(RwLock::new(None)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(BusEndpoint::Internal { name: name.to_owned() })
    }
}

async fn consume(
    mut queue: Queue,
    handler: Arc<RwLock<Option<Arc<dyn BusHandler>>>>,
    cancel: CancellationToken,
) -> Queue {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let current = handler.read().unwrap_or_else(|p| p.into_inner()).clone();
        match current {
            // One task per item: a slow handler never stalls the loop.
            Some(h) => {
                tokio::spawn(async move { h.handle(message).await });
            }
            None => warn!(message_id = %message.message_id, "no bus handler, dropping message"),
        }
    }
    debug!("internal bus consume loop finished");
    queue
}

#[async_trait]
impl MessageBus for InternalBus {
    fn endpoint(&self) -> &BusEndpoint {
        &self.endpoint
    }

    fn set_handler(&self, handler: Arc<dyn BusHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| ProtocolError::Bus("internal queue lost".into()))?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(queue, Arc::clone(&self.handler), cancel.clone()));
        *running = Some((cancel, task));
        info!(bus = %self.endpoint, "internal bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        let Some((cancel, task)) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        let queue = task
            .await
            .map_err(|e| ProtocolError::Bus(format!("consume loop failed: {e}")))?;
        *self.queue.lock().unwrap_or_else(|p| p.into_inner()) = Some(queue);
        info!(bus = %self.endpoint, "internal bus stopped");
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> Result<(), ProtocolError> {
        debug!(message_id = %message.message_id, "publishing on internal bus");
        self.tx
            .send(message)
            .map_err(|e| ProtocolError::Bus(format!("internal queue closed: {e}")))
    }
}
