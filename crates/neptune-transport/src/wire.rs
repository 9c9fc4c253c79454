//! Compact relay message and its UDP framing.
//!
//! Packet layout:
//!
//! ```text
//! +--------+-------------+----------------------------------+
//! | "NEPT" | len: u32 LE | MessagePack map (len bytes)      |
//! +--------+-------------+----------------------------------+
//! ```
//!
//! The map keys are the field names of [`RelayMessage`] in declaration
//! order, so any MessagePack reader can decode a packet without schema.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::envelope::{EncryptionType, Envelope, MessageType};
use crate::error::TransportError;
use crate::identity::is_channel_address;

pub const FRAME_MAGIC: &[u8; 4] = b"NEPT";
pub const FRAME_HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_HOPS: u32 = 5;

/// `transport_metadata` keys carrying relay state inside an [`Envelope`].
pub const META_HOPS: &str = "hops";
pub const META_MAX_HOPS: &str = "max_hops";
pub const META_HISTORY: &str = "history";

fn default_max_hops() -> u32 {
    DEFAULT_MAX_HOPS
}

/// Message as it travels between nodes.
///
/// `payload` is opaque to relays (transit ciphertext). `history` is
/// append-only: each relay adds one `"<node>:<meta>"` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub timestamp: u64,
    pub payload: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub hops: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default)]
    pub history: Vec<String>,
}

impl RelayMessage {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            timestamp: crate::now_secs(),
            payload: payload.into(),
            signature: String::new(),
            hops: 0,
            max_hops: DEFAULT_MAX_HOPS,
            history: Vec::new(),
        }
    }

    /// Node names recorded in `history`, oldest first.
    pub fn visited(&self) -> impl Iterator<Item = &str> {
        self.history
            .iter()
            .map(|entry| entry.split_once(':').map_or(entry.as_str(), |(node, _)| node))
    }

    pub fn has_visited(&self, node: &str) -> bool {
        self.visited().any(|n| n == node)
    }

    pub fn hops_remaining(&self) -> u32 {
        self.max_hops.saturating_sub(self.hops)
    }

    // ── Binary encoding ──

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Encode and frame for a datagram.
    pub fn encode_frame(&self) -> Result<Bytes, TransportError> {
        let body = self.to_bytes()?;
        let len = u32::try_from(body.len()).map_err(|_| TransportError::MessageTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_slice(FRAME_MAGIC);
        buf.put_u32_le(len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse one framed packet. The whole datagram must be exactly one frame.
    pub fn decode_frame(packet: &[u8], max_len: usize) -> Result<Self, TransportError> {
        if packet.len() < FRAME_HEADER_LEN {
            return Err(TransportError::Frame(format!(
                "{} bytes is shorter than the frame header",
                packet.len()
            )));
        }
        if &packet[..4] != FRAME_MAGIC {
            return Err(TransportError::Frame("bad magic tag".into()));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&packet[4..FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > max_len {
            return Err(TransportError::MessageTooLarge { size: len, max: max_len });
        }
        let body = &packet[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(TransportError::Frame(format!(
                "declared length {len}, got {} bytes",
                body.len()
            )));
        }
        Self::from_bytes(body)
    }

    // ── Envelope conversion ──

    /// Lift relay state out of an envelope's `transport_metadata`.
    pub fn from_envelope(env: &Envelope) -> Result<Self, TransportError> {
        let to = env
            .routing
            .recipient
            .clone()
            .or_else(|| env.routing.channel.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                TransportError::InvalidArgument(format!(
                    "envelope {} has no destination",
                    env.header.message_id
                ))
            })?;

        let meta = &env.routing.transport_metadata;
        let counter = |key: &str, default: u32| -> Result<u32, TransportError> {
            match meta.get(key).and_then(|v| v.as_u64()) {
                None => Ok(default),
                Some(v) => u32::try_from(v).map_err(|_| {
                    TransportError::Frame(format!("{key} out of range: {v}"))
                }),
            }
        };
        let hops = counter(META_HOPS, 0)?;
        let max_hops = counter(META_MAX_HOPS, DEFAULT_MAX_HOPS)?;
        let history = meta
            .get(META_HISTORY)
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: env.header.message_id.clone(),
            from: env.header.sender_id.clone(),
            to,
            timestamp: env.header.timestamp,
            payload: env.payload.data.clone(),
            signature: env.crypto.signature.clone().unwrap_or_default(),
            hops,
            max_hops,
            history,
        })
    }

    /// Wrap as an envelope for the transport layer. Relay state goes into
    /// `transport_metadata` so it survives the trip through [`Transport::send`].
    ///
    /// [`Transport::send`]: crate::Transport::send
    pub fn to_envelope(&self) -> Envelope {
        let channel = is_channel_address(&self.to);
        let mut builder = Envelope::builder(
            self.from.clone(),
            if channel { MessageType::Message } else { MessageType::Privmsg },
        )
        .message_id(self.id.clone())
        .timestamp(self.timestamp)
        .encryption(EncryptionType::None)
        .binary(self.payload.clone())
        .metadata(META_HOPS, self.hops.into())
        .metadata(META_MAX_HOPS, self.max_hops.into())
        .metadata(META_HISTORY, self.history.clone().into());

        builder = if channel {
            builder.channel(self.to.clone())
        } else {
            builder.recipient(self.to.clone())
        };
        if !self.signature.is_empty() {
            builder = builder.signature(self.signature.clone());
        }
        builder.build()
    }
}
