//! Send-request dispatch and relayed-message routing.
//!
//! [`Dispatcher::dispatch`] wraps a `{from, to, message}` request, transit
//! encrypts it with the deployment key and publishes it on the bus. The
//! bus hands every consumed item back to the [`RelayHandler`], which
//! decides where it goes:
//!
//! - channel address: handed to the [`ChannelFanout`] collaborator
//! - user on this node: sealed for the recipient, signed, stored
//! - user on another node: forwarded over the transport manager as a
//!   compact relay message, subject to the hop ceiling and loop check
//!
//! Messages that arrive over a transport take the same path with the relay
//! state they carried.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use neptune_transport::{
    is_channel_address, now_secs, require_channel_name, Envelope, NeptuneId, RelayMessage,
    TransportManager, DEFAULT_MAX_HOPS,
};

use crate::bus::{BusHandler, BusMessage, MessageBus};
use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::relay::{prepare_forward, DropReason};
use crate::store::{DeliveryRecord, MessageStore};

/// Message ids remembered for duplicate suppression.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

// ── Config ─────────────────────────────────────────────────────────────

/// Dispatcher settings.
///
/// `max_hops` falls back to `NEPTUNE_MAX_HOPS` when set, else 5.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node_name: String,
    pub shared_key: String,
    pub max_hops: u32,
    pub dedup_capacity: usize,
}

impl DispatcherConfig {
    pub fn new(node_name: impl Into<String>, shared_key: impl Into<String>) -> Self {
        let max_hops = std::env::var("NEPTUNE_MAX_HOPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_HOPS);
        Self {
            node_name: node_name.into(),
            shared_key: shared_key.into(),
            max_hops,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Node names end up in `user@node` addresses and `node:meta` history
    /// entries, so neither separator may appear in one.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.node_name.is_empty() {
            return Err(ProtocolError::Config("node name is empty".into()));
        }
        if self.node_name.contains(['@', ':']) || self.node_name.chars().any(char::is_whitespace) {
            return Err(ProtocolError::Config(format!(
                "node name {:?} may not contain '@', ':' or whitespace",
                self.node_name
            )));
        }
        if self.shared_key.is_empty() {
            return Err(ProtocolError::Config("shared key is empty".into()));
        }
        if self.max_hops == 0 {
            return Err(ProtocolError::Config("max_hops must be at least 1".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(ProtocolError::Config("dedup_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Types ──────────────────────────────────────────────────────────────

/// A send request as it travels through the bus, transit-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub message_id: String,
    pub message: String,
    /// Node that accepted the request.
    pub source_node: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// What the relay handler did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Stored for a local user.
    Delivered { record_id: String },
    /// Handed to channel fan-out.
    Channel { channel: String },
    /// Sent toward `node`; `hops` is the count carried on the wire.
    Forwarded { node: String, hops: u32 },
    Dropped(DropReason),
}

/// Delivers channel traffic to members. Membership lives elsewhere.
#[async_trait]
pub trait ChannelFanout: Send + Sync {
    async fn fan_out(&self, channel: &str, message: &OutgoingMessage) -> Result<(), ProtocolError>;
}

// ── Relay handler ──────────────────────────────────────────────────────

/// Consumer side of the dispatcher. Registered as the bus handler and fed
/// by the node's transport event loop.
pub struct RelayHandler {
    config: DispatcherConfig,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    transports: Arc<TransportManager>,
    fanout: RwLock<Option<Arc<dyn ChannelFanout>>>,
    seen: Mutex<LruCache<String, ()>>,
}

impl RelayHandler {
    fn new(
        config: DispatcherConfig,
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        transports: Arc<TransportManager>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.dedup_capacity)
            .ok_or_else(|| ProtocolError::Config("dedup_capacity must be at least 1".into()))?;
        Ok(Self {
            config,
            crypto,
            store,
            transports,
            fanout: RwLock::new(None),
            seen: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Claim `message_id`; `true` if it was already claimed.
    fn seen_before(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if seen.contains(message_id) {
            seen.promote(message_id);
            return true;
        }
        seen.put(message_id.to_owned(), ());
        false
    }

    /// Release a claim so the same message can be tried again.
    fn forget(&self, message_id: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop(message_id);
    }

    fn open(&self, ciphertext: &str) -> Result<OutgoingMessage, DropReason> {
        let json = self
            .crypto
            .decrypt_string(ciphertext, &self.config.shared_key)
            .map_err(|e| DropReason::Malformed(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| DropReason::Malformed(e.to_string()))
    }

    /// Handle one item consumed from the bus. A fresh relay state starts
    /// here: no hops, empty history.
    pub async fn on_relayed(&self, message: BusMessage) -> Result<RelayOutcome, ProtocolError> {
        let outgoing = match self.open(&message.payload) {
            Ok(outgoing) => outgoing,
            Err(reason) => return Ok(RelayOutcome::Dropped(reason)),
        };
        if outgoing.message_id != message.message_id {
            return Ok(RelayOutcome::Dropped(DropReason::Malformed(
                "bus id does not match message id".into(),
            )));
        }
        let mut relay = RelayMessage::new(
            outgoing.message_id.clone(),
            outgoing.from.clone(),
            outgoing.to.clone(),
            message.payload,
        );
        relay.timestamp = outgoing.timestamp;
        relay.max_hops = self.config.max_hops;
        self.route(outgoing, relay).await
    }

    /// Handle a relay message that arrived over a transport.
    pub async fn on_transport_message(
        &self,
        envelope: &Envelope,
    ) -> Result<RelayOutcome, ProtocolError> {
        let relay = match RelayMessage::from_envelope(envelope) {
            Ok(relay) => relay,
            Err(e) => return Ok(RelayOutcome::Dropped(DropReason::Malformed(e.to_string()))),
        };
        let outgoing = match self.open(&relay.payload) {
            Ok(outgoing) => outgoing,
            Err(reason) => return Ok(RelayOutcome::Dropped(reason)),
        };
        if outgoing.message_id != relay.id || outgoing.to != relay.to {
            return Ok(RelayOutcome::Dropped(DropReason::Malformed(
                "relay header does not match payload".into(),
            )));
        }
        self.route(outgoing, relay).await
    }

    /// Route at most once per message id. Attempts that failed for a
    /// reason that may clear up (no usable transport, unknown user, store
    /// or crypto error) release the id again.
    async fn route(
        &self,
        outgoing: OutgoingMessage,
        relay: RelayMessage,
    ) -> Result<RelayOutcome, ProtocolError> {
        let message_id = outgoing.message_id.clone();
        if self.seen_before(&message_id) {
            return Ok(RelayOutcome::Dropped(DropReason::Duplicate));
        }
        let result = self.route_once(outgoing, relay).await;
        let retryable = matches!(
            result,
            Err(_)
                | Ok(RelayOutcome::Dropped(
                    DropReason::Undeliverable | DropReason::UnknownRecipient
                ))
        );
        if retryable {
            self.forget(&message_id);
        }
        result
    }

    async fn route_once(
        &self,
        outgoing: OutgoingMessage,
        relay: RelayMessage,
    ) -> Result<RelayOutcome, ProtocolError> {
        if is_channel_address(&outgoing.to) {
            return self.fan_out(outgoing).await;
        }

        let recipient: NeptuneId = match outgoing.to.parse() {
            Ok(id) => id,
            Err(e) => return Ok(RelayOutcome::Dropped(DropReason::Malformed(format!("{e}")))),
        };

        if recipient.is_on(&self.config.node_name) {
            self.deliver_local(&outgoing, &recipient, &relay).await
        } else {
            Ok(self.forward(&relay, recipient.server()).await)
        }
    }

    async fn fan_out(&self, outgoing: OutgoingMessage) -> Result<RelayOutcome, ProtocolError> {
        let channel = outgoing.to.clone();
        let fanout = self.fanout.read().unwrap_or_else(|p| p.into_inner()).clone();
        match fanout {
            Some(fanout) => fanout.fan_out(&channel, &outgoing).await?,
            None => {
                info!(%channel, message_id = %outgoing.message_id, "no channel fan-out configured")
            }
        }
        Ok(RelayOutcome::Channel { channel })
    }

    async fn deliver_local(
        &self,
        outgoing: &OutgoingMessage,
        recipient: &NeptuneId,
        relay: &RelayMessage,
    ) -> Result<RelayOutcome, ProtocolError> {
        let Some(user) = self.store.find_user(recipient.local()).await? else {
            return Ok(RelayOutcome::Dropped(DropReason::UnknownRecipient));
        };

        let plaintext = outgoing.message.as_bytes();
        let record = DeliveryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: outgoing.message_id.clone(),
            from: outgoing.from.clone(),
            to: outgoing.to.clone(),
            payload: self.crypto.encrypt_for(plaintext, &user.public_key)?,
            signature: self.crypto.sign(plaintext)?,
            created_at: now_secs(),
            timestamp: outgoing.timestamp,
            hops: 0,
            max_hops: relay.max_hops,
            route: relay.visited().map(str::to_owned).collect(),
            inbox: true,
            read: false,
        };
        let record_id = record.id.clone();
        self.store.insert_delivery(record).await?;
        Ok(RelayOutcome::Delivered { record_id })
    }

    async fn forward(&self, relay: &RelayMessage, node: &str) -> RelayOutcome {
        let next = match prepare_forward(relay, &self.config.node_name, now_secs()) {
            Ok(next) => next,
            Err(reason) => return RelayOutcome::Dropped(reason),
        };
        if !self.transports.send(&next.to_envelope()).await {
            return RelayOutcome::Dropped(DropReason::Undeliverable);
        }
        RelayOutcome::Forwarded {
            node: node.to_owned(),
            hops: next.hops,
        }
    }
}

fn log_outcome(message_id: &str, result: &Result<RelayOutcome, ProtocolError>) {
    match result {
        Ok(RelayOutcome::Delivered { record_id }) => {
            info!(%message_id, %record_id, "delivered locally")
        }
        Ok(RelayOutcome::Channel { channel }) => {
            debug!(%message_id, %channel, "handed to channel fan-out")
        }
        Ok(RelayOutcome::Forwarded { node, hops }) => info!(%message_id, %node, hops, "forwarded"),
        Ok(RelayOutcome::Dropped(DropReason::Duplicate)) => {
            debug!(%message_id, "duplicate dropped")
        }
        Ok(RelayOutcome::Dropped(reason)) => warn!(%message_id, %reason, "message dropped"),
        Err(e) => warn!(%message_id, "relay handling failed: {e}"),
    }
}

#[async_trait]
impl BusHandler for RelayHandler {
    async fn handle(&self, message: BusMessage) {
        let message_id = message.message_id.clone();
        let result = self.on_relayed(message).await;
        log_outcome(&message_id, &result);
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────────

pub struct Dispatcher {
    relay: Arc<RelayHandler>,
    bus: Arc<dyn MessageBus>,
}

impl Dispatcher {
    /// Validate `config` and register the relay handler on `bus`.
    pub fn new(
        config: DispatcherConfig,
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        transports: Arc<TransportManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, ProtocolError> {
        let relay = Arc::new(RelayHandler::new(config, crypto, store, transports)?);
        bus.set_handler(relay.clone());
        Ok(Self { relay, bus })
    }

    pub fn set_fanout(&self, fanout: Arc<dyn ChannelFanout>) {
        *self.relay.fanout.write().unwrap_or_else(|p| p.into_inner()) = Some(fanout);
    }

    pub fn relay(&self) -> &Arc<RelayHandler> {
        &self.relay
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Publish a send request. Returns the message id once the bus has
    /// accepted it; delivery is not awaited.
    pub async fn dispatch(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> Result<String, ProtocolError> {
        from.parse::<NeptuneId>()
            .map_err(|e| ProtocolError::InvalidArgument(format!("sender: {e}")))?;
        if is_channel_address(to) {
            require_channel_name(to).map_err(|e| ProtocolError::InvalidArgument(e.to_string()))?;
        } else {
            to.parse::<NeptuneId>()
                .map_err(|e| ProtocolError::InvalidArgument(format!("recipient: {e}")))?;
        }

        let config = &self.relay.config;
        let outgoing = OutgoingMessage {
            from: from.to_owned(),
            to: to.to_owned(),
            message_id: uuid::Uuid::new_v4().to_string(),
            message: text.to_owned(),
            source_node: config.node_name.clone(),
            timestamp: now_secs(),
        };
        let payload = self
            .relay
            .crypto
            .encrypt_string(&serde_json::to_string(&outgoing)?, &config.shared_key)?;

        self.bus
            .publish(BusMessage {
                message_id: outgoing.message_id.clone(),
                source_node: outgoing.source_node,
                payload,
            })
            .await?;
        debug!(message_id = %outgoing.message_id, %from, %to, "dispatched");
        Ok(outgoing.message_id)
    }

    pub async fn on_relayed(&self, message: BusMessage) -> Result<RelayOutcome, ProtocolError> {
        self.relay.on_relayed(message).await
    }

    /// Route a transport-delivered envelope and log what happened to it.
    pub async fn on_transport_message(
        &self,
        envelope: &Envelope,
    ) -> Result<RelayOutcome, ProtocolError> {
        let result = self.relay.on_transport_message(envelope).await;
        log_outcome(envelope.message_id(), &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(DispatcherConfig::new("node1", "k").with_max_hops(5).validate().is_ok());
        for bad in [
            DispatcherConfig::new("", "k"),
            DispatcherConfig::new("node:1", "k"),
            DispatcherConfig::new("a@b", "k"),
            DispatcherConfig::new("node1", ""),
            DispatcherConfig::new("node1", "k").with_max_hops(0),
            DispatcherConfig::new("node1", "k").with_dedup_capacity(0),
        ] {
            assert!(matches!(bad.validate(), Err(ProtocolError::Config(_))), "{bad:?}");
        }
    }

    #[test]
    fn outgoing_json_shape() {
        let msg = OutgoingMessage {
            from: "alice@n1".into(),
            to: "bob@n2".into(),
            message_id: "m".into(),
            message: "hi".into(),
            source_node: "n1".into(),
            timestamp: 7,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["source_node"], "n1");
        assert_eq!(value["message_id"], "m");

        let old: OutgoingMessage = serde_json::from_str(
            r#"{"from":"a@n","to":"b@n","message_id":"x","message":"m","source_node":"n"}"#,
        )
        .unwrap();
        assert_eq!(old.timestamp, 0);
    }
}
