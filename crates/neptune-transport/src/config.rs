use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Default UDP port for Neptune relay traffic.
pub const DEFAULT_UDP_PORT: u16 = 32002;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Loosely typed per-transport settings, as read from a config file.
///
/// Values stay strings until a transport asks for them with a type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportOptions(BTreeMap<String, String>);

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, TransportError> {
        self.get(key)
            .map(|v| {
                v.trim().parse().map_err(|_| {
                    TransportError::Config(format!("{key}: expected an integer, got {v:?}"))
                })
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, TransportError> {
        self.get(key)
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(TransportError::Config(format!(
                    "{key}: expected a boolean, got {v:?}"
                ))),
            })
            .transpose()
    }
}

/// Configuration for a [`UdpTransport`](crate::UdpTransport).
///
/// ```rust
/// use neptune_transport::UdpTransportConfig;
///
/// let config = UdpTransportConfig::new("udp-lan")
///     .port(40000)
///     .broadcast(false)
///     .target("192.168.1.20:40000".parse().unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    pub(crate) id: String,
    pub(crate) bind_ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) broadcast: bool,
    /// Where outbound frames go. Defaults to the limited broadcast address.
    pub(crate) target: Option<SocketAddr>,
    pub(crate) max_packet_size: usize,
    /// How many of our own sent ids to remember for echo suppression.
    pub(crate) echo_cache: usize,
    /// How many neighbours to remember; the least recently heard goes first.
    pub(crate) peer_cache: usize,
}

impl UdpTransportConfig {
    /// Defaults: all interfaces, port 32002 (or `NEPTUNE_UDP_PORT`),
    /// broadcast on.
    pub fn new(id: impl Into<String>) -> Self {
        let port = std::env::var("NEPTUNE_UDP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_UDP_PORT);

        Self {
            id: id.into(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            broadcast: true,
            target: None,
            max_packet_size: MAX_UDP_PAYLOAD,
            echo_cache: 1024,
            peer_cache: 256,
        }
    }

    /// Read `bind`, `port`, `broadcast`, `target`, `max_packet_size` and
    /// `peer_cache` from loose options, on top of the defaults.
    pub fn from_options(
        id: impl Into<String>,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let mut config = Self::new(id);
        if let Some(ip) = options.get("bind") {
            config.bind_ip = ip
                .parse()
                .map_err(|_| TransportError::Config(format!("bind: invalid ip {ip:?}")))?;
        }
        if let Some(port) = options.get_int("port")? {
            config.port = u16::try_from(port)
                .map_err(|_| TransportError::Config(format!("port: {port} out of range")))?;
        }
        if let Some(broadcast) = options.get_bool("broadcast")? {
            config.broadcast = broadcast;
        }
        if let Some(target) = options.get("target") {
            config.target = Some(target.parse().map_err(|_| {
                TransportError::Config(format!("target: invalid address {target:?}"))
            })?);
        }
        if let Some(max) = options.get_int("max_packet_size")? {
            config.max_packet_size = usize::try_from(max)
                .ok()
                .filter(|m| (1..=MAX_UDP_PAYLOAD).contains(m))
                .ok_or_else(|| {
                    TransportError::Config(format!("max_packet_size: {max} out of range"))
                })?;
        }
        if let Some(peers) = options.get_int("peer_cache")? {
            config.peer_cache = usize::try_from(peers)
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    TransportError::Config(format!("peer_cache: {peers} out of range"))
                })?;
        }
        Ok(config)
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Local port; 0 picks an ephemeral one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn target(mut self, addr: SocketAddr) -> Self {
        self.target = Some(addr);
        self
    }

    pub fn max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes.min(MAX_UDP_PAYLOAD);
        self
    }

    pub fn echo_cache(mut self, entries: usize) -> Self {
        self.echo_cache = entries;
        self
    }

    pub fn peer_cache(mut self, entries: usize) -> Self {
        self.peer_cache = entries;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Destination for outbound frames.
    pub fn resolved_target(&self) -> Result<SocketAddr, TransportError> {
        match (self.target, self.broadcast) {
            (Some(addr), _) => Ok(addr),
            (None, true) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port)),
            (None, false) => Err(TransportError::Config(format!(
                "{}: no target and broadcast disabled",
                self.id
            ))),
        }
    }
}
