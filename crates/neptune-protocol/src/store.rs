//! Storage collaborator contract and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ProtocolError;

/// A user hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Hex Ed25519 public key used to seal deliveries.
    pub public_key: String,
}

/// One message delivered into a local inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub message_id: String,
    pub from: String,
    pub to: String,
    /// Sealed for the recipient.
    pub payload: String,
    /// This node's signature over the plaintext.
    pub signature: String,
    /// Unix seconds the record was written.
    pub created_at: u64,
    /// Unix seconds the message was first dispatched.
    pub timestamp: u64,
    pub hops: u32,
    pub max_hops: u32,
    /// Relay path the message took to reach this node.
    pub route: Vec<String>,
    pub inbox: bool,
    pub read: bool,
}

pub type DeliveryFilter<'a> = &'a (dyn Fn(&DeliveryRecord) -> bool + Send + Sync);

/// Keyed-entity storage the dispatcher writes local deliveries to.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProtocolError>;

    async fn insert_delivery(&self, record: DeliveryRecord) -> Result<(), ProtocolError>;

    /// Replace the record with the same `id`. `false` if there was none.
    async fn update_delivery(&self, record: DeliveryRecord) -> Result<bool, ProtocolError>;

    async fn query_deliveries(
        &self,
        filter: DeliveryFilter<'_>,
    ) -> Result<Vec<DeliveryRecord>, ProtocolError>;
}

/// Process-local store. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    deliveries: RwLock<Vec<DeliveryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, username: impl Into<String>, public_key: impl Into<String>) {
        let username = username.into();
        self.users.write().await.insert(
            username.clone(),
            UserRecord {
                username,
                public_key: public_key.into(),
            },
        );
    }

    /// Inbox for `recipient` (full `user@node` address), oldest first.
    pub async fn inbox(&self, recipient: &str) -> Vec<DeliveryRecord> {
        self.deliveries
            .read()
            .await
            .iter()
            .filter(|r| r.inbox && r.to == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProtocolError> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn insert_delivery(&self, record: DeliveryRecord) -> Result<(), ProtocolError> {
        let mut deliveries = self.deliveries.write().await;
        if deliveries.iter().any(|r| r.id == record.id) {
            return Err(ProtocolError::Storage(format!("duplicate delivery id {}", record.id)));
        }
        deliveries.push(record);
        Ok(())
    }

    async fn update_delivery(&self, record: DeliveryRecord) -> Result<bool, ProtocolError> {
        let mut deliveries = self.deliveries.write().await;
        match deliveries.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                *slot = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_deliveries(
        &self,
        filter: DeliveryFilter<'_>,
    ) -> Result<Vec<DeliveryRecord>, ProtocolError> {
        Ok(self
            .deliveries
            .read()
            .await
            .iter()
            .filter(|r| filter(r))
            .cloned()
            .collect())
    }
}
