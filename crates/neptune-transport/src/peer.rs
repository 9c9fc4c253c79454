use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// How a peer is currently reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    None,
    Direct,
    Relayed,
    /// Store-and-forward links (radio duty cycles, sleepy devices).
    Intermittent,
}

/// Transport-specific peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "address")]
pub enum EndpointInfo {
    Ip(SocketAddr),
    Bluetooth(String),
    LoRa(String),
    Custom(String),
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointInfo::Ip(addr) => write!(f, "ip:{addr}"),
            EndpointInfo::Bluetooth(mac) => write!(f, "bt:{mac}"),
            EndpointInfo::LoRa(dev) => write!(f, "lora:{dev}"),
            EndpointInfo::Custom(s) => write!(f, "custom:{s}"),
        }
    }
}

/// Best-effort view of a neighbour, as seen by one transport.
///
/// Peers are correlated across transports only through `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub endpoint: EndpointInfo,
    /// Unix seconds.
    pub last_seen: u64,
    pub connection_type: ConnectionType,
    pub available_transports: BTreeSet<TransportKind>,
    pub round_trip_ms: f64,
    pub capabilities: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
}

impl PeerInfo {
    pub fn new(node_id: impl Into<String>, endpoint: EndpointInfo, via: TransportKind) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint,
            last_seen: crate::now_secs(),
            connection_type: ConnectionType::Direct,
            available_transports: BTreeSet::from([via]),
            round_trip_ms: 0.0,
            capabilities: BTreeMap::new(),
            signal_strength: None,
            battery_level: None,
        }
    }

    /// Fold another sighting of the same node into this one. The fresher
    /// sighting wins for address and link quality; transports accumulate.
    pub fn merge(&mut self, other: PeerInfo) {
        debug_assert_eq!(self.node_id, other.node_id);
        self.available_transports
            .extend(other.available_transports.iter().cloned());
        self.capabilities.extend(other.capabilities.clone());
        if other.last_seen >= self.last_seen {
            self.endpoint = other.endpoint;
            self.last_seen = other.last_seen;
            self.connection_type = other.connection_type;
            if other.round_trip_ms > 0.0 {
                self.round_trip_ms = other.round_trip_ms;
            }
            self.signal_strength = other.signal_strength.or(self.signal_strength);
            self.battery_level = other.battery_level.or(self.battery_level);
        }
    }
}
