//! Control-plane message envelope.
//!
//! The envelope is the canonical JSON form of a Neptune message: snake_case
//! field names, lower_snake_case enum values, unix-second timestamps.
//! Every field has a default so a partially filled document still decodes;
//! [`Envelope::is_valid`] is where structural requirements are enforced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::now_secs;

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: &str = "1.0";

// ── Enumerations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Channel message.
    #[default]
    Message,
    /// Private (user to user) message.
    Privmsg,
    Join,
    Leave,
    Ping,
    Pong,
    Info,
    Error,
}

impl MessageType {
    /// Control traffic that should ride the lowest-latency transport.
    pub fn is_latency_sensitive(self) -> bool {
        matches!(self, MessageType::Ping | MessageType::Pong | MessageType::Error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    /// End-to-end, keyed to the recipient's public key.
    E2e,
    /// Shared channel key, identified by `crypto.channel_key_id`.
    Channel,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Text,
    Json,
    Binary,
}

// ── Sections ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub message_id: String,
    pub sender_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub encryption_type: EncryptionType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Routing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Free-form per-transport data (relay hop state travels here).
    pub transport_metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    pub data: String,
    pub format: PayloadFormat,
    pub content_type: String,
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            data: String::new(),
            format: PayloadFormat::Text,
            content_type: "text/plain".into(),
        }
    }
}

// ── Envelope ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub version: String,
    pub header: Header,
    pub routing: Routing,
    pub crypto: CryptoInfo,
    pub payload: Payload,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            version: ENVELOPE_VERSION.into(),
            header: Header::default(),
            routing: Routing::default(),
            crypto: CryptoInfo::default(),
            payload: Payload::default(),
        }
    }
}

fn is_set(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.is_empty())
}

fn require(arg: &str, what: &str) -> Result<(), TransportError> {
    if arg.trim().is_empty() {
        return Err(TransportError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}

impl Envelope {
    /// Start an envelope of `message_type` from `sender_id` with a fresh
    /// id and the current timestamp.
    pub fn builder(sender_id: impl Into<String>, message_type: MessageType) -> EnvelopeBuilder {
        EnvelopeBuilder::new(sender_id, message_type)
    }

    /// Structural validity. Never panics, whatever the field contents.
    pub fn is_valid(&self) -> bool {
        if self.version.is_empty()
            || self.header.message_id.is_empty()
            || self.header.sender_id.is_empty()
        {
            return false;
        }

        let routed = match self.header.message_type {
            MessageType::Message | MessageType::Join | MessageType::Leave => {
                is_set(&self.routing.channel)
            }
            MessageType::Privmsg | MessageType::Error => is_set(&self.routing.recipient),
            MessageType::Ping | MessageType::Pong | MessageType::Info => true,
        };

        let keyed = match self.header.encryption_type {
            EncryptionType::E2e => is_set(&self.crypto.public_key),
            EncryptionType::Channel => is_set(&self.crypto.channel_key_id),
            EncryptionType::None => true,
        };

        routed && keyed
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json).map_err(|e| TransportError::Deserialization(e.to_string()))
    }

    /// Deep copy through the canonical JSON form.
    pub fn deep_clone(&self) -> Result<Self, TransportError> {
        let value =
            serde_json::to_value(self).map_err(|e| TransportError::Serialization(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| TransportError::Deserialization(e.to_string()))
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    // ── Constructors ──

    /// Channel text message. Encrypted with the channel key, so the caller
    /// must still set `crypto.channel_key_id` before it validates.
    pub fn channel_message(
        sender: &str,
        channel: &str,
        text: &str,
    ) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        require(channel, "channel")?;
        require(text, "text")?;
        Ok(Self::builder(sender, MessageType::Message)
            .channel(channel)
            .encryption(EncryptionType::Channel)
            .text(text)
            .build())
    }

    /// Private message. Encrypted end to end, so the caller must set
    /// `crypto.public_key` before it validates.
    pub fn private_message(
        sender: &str,
        recipient: &str,
        text: &str,
    ) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        require(recipient, "recipient")?;
        require(text, "text")?;
        Ok(Self::builder(sender, MessageType::Privmsg)
            .recipient(recipient)
            .encryption(EncryptionType::E2e)
            .text(text)
            .build())
    }

    pub fn join(sender: &str, channel: &str) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        require(channel, "channel")?;
        Ok(Self::builder(sender, MessageType::Join).channel(channel).build())
    }

    pub fn leave(sender: &str, channel: &str) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        require(channel, "channel")?;
        Ok(Self::builder(sender, MessageType::Leave).channel(channel).build())
    }

    /// Ping carrying a random token the pong must echo.
    pub fn ping(sender: &str) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        Ok(Self::builder(sender, MessageType::Ping)
            .text(uuid::Uuid::new_v4().simple().to_string())
            .build())
    }

    /// Answer to `ping`: addressed back to its sender, echoing its token.
    pub fn pong(sender: &str, ping: &Envelope) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        if ping.header.message_type != MessageType::Ping {
            return Err(TransportError::InvalidArgument(format!(
                "pong requires a ping, got {:?}",
                ping.header.message_type
            )));
        }
        Ok(Self::builder(sender, MessageType::Pong)
            .recipient(ping.header.sender_id.clone())
            .text(ping.payload.data.clone())
            .build())
    }

    /// Error report with a JSON body `{"message": .., "code": ..}`.
    pub fn error(
        sender: &str,
        recipient: &str,
        message: &str,
        code: Option<&str>,
    ) -> Result<Self, TransportError> {
        require(sender, "sender")?;
        require(recipient, "recipient")?;
        require(message, "error message")?;
        let body = serde_json::json!({ "message": message, "code": code });
        Ok(Self::builder(sender, MessageType::Error)
            .recipient(recipient)
            .json(body.to_string())
            .build())
    }
}

// ── Builder ────────────────────────────────────────────────────────────

/// Fluent builder for envelopes.
///
/// ```rust
/// use neptune_transport::{Envelope, MessageType};
///
/// let env = Envelope::builder("alice@n1", MessageType::Privmsg)
///     .recipient("bob@n2")
///     .text("hi")
///     .build();
/// assert!(env.is_valid());
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn new(sender_id: impl Into<String>, message_type: MessageType) -> Self {
        let mut envelope = Envelope::default();
        envelope.header = Header {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            timestamp: now_secs(),
            message_type,
            encryption_type: EncryptionType::None,
        };
        Self { envelope }
    }

    /// Pin the message id (relayed messages keep their origin id).
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.header.message_id = id.into();
        self
    }

    pub fn timestamp(mut self, secs: u64) -> Self {
        self.envelope.header.timestamp = secs;
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.envelope.routing.channel = Some(channel.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.envelope.routing.recipient = Some(recipient.into());
        self
    }

    pub fn encryption(mut self, encryption: EncryptionType) -> Self {
        self.envelope.header.encryption_type = encryption;
        self
    }

    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.envelope.crypto.public_key = Some(key.into());
        self
    }

    pub fn channel_key_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.crypto.channel_key_id = Some(id.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.envelope.crypto.signature = Some(signature.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.envelope.routing.transport_metadata.insert(key.into(), value);
        self
    }

    pub fn text(mut self, data: impl Into<String>) -> Self {
        self.envelope.payload = Payload {
            data: data.into(),
            format: PayloadFormat::Text,
            content_type: "text/plain".into(),
        };
        self
    }

    pub fn json(mut self, data: impl Into<String>) -> Self {
        self.envelope.payload = Payload {
            data: data.into(),
            format: PayloadFormat::Json,
            content_type: "application/json".into(),
        };
        self
    }

    /// Opaque payload, already encoded as text (base64/hex ciphertext).
    pub fn binary(mut self, data: impl Into<String>) -> Self {
        self.envelope.payload = Payload {
            data: data.into(),
            format: PayloadFormat::Binary,
            content_type: "application/octet-stream".into(),
        };
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_snake_case_and_lowercase_enums() {
        let env = Envelope::builder("alice@n1", MessageType::Privmsg)
            .recipient("bob@n2")
            .encryption(EncryptionType::E2e)
            .public_key("pk")
            .text("hi")
            .build();
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(value["version"], "1.0");
        assert_eq!(value["header"]["type"], "privmsg");
        assert_eq!(value["header"]["encryption_type"], "e2e");
        assert_eq!(value["routing"]["recipient"], "bob@n2");
        assert_eq!(value["payload"]["format"], "text");
        assert_eq!(value["payload"]["content_type"], "text/plain");
        assert!(value["routing"].get("channel").is_none());
    }

    #[test]
    fn json_roundtrip_preserves_everything() {
        let env = Envelope::builder("alice@n1", MessageType::Message)
            .channel("#general")
            .encryption(EncryptionType::Channel)
            .channel_key_id("k1")
            .metadata("hops", serde_json::json!(2))
            .text("hello")
            .build();
        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn channel_message_needs_channel() {
        let mut env = Envelope::builder("alice@n1", MessageType::Message)
            .channel("#general")
            .text("x")
            .build();
        assert!(env.is_valid());
        env.routing.channel = None;
        assert!(!env.is_valid());
        env.routing.channel = Some(String::new());
        assert!(!env.is_valid());
    }

    #[test]
    fn e2e_privmsg_needs_public_key() {
        let env = Envelope::private_message("alice@n1", "bob@n2", "secret").unwrap();
        assert_eq!(env.header.encryption_type, EncryptionType::E2e);
        assert!(env.crypto.public_key.is_none());
        assert!(!env.is_valid());

        let mut keyed = env.clone();
        keyed.crypto.public_key = Some("pk".into());
        assert!(keyed.is_valid());
    }

    #[test]
    fn missing_message_id_is_invalid() {
        let json = r##"{"version":"1.0","header":{"sender_id":"a@n","type":"ping"}}"##;
        let env = Envelope::from_json(json).unwrap();
        assert!(env.header.message_id.is_empty());
        assert!(!env.is_valid());
    }

    #[test]
    fn empty_version_is_invalid() {
        let mut env = Envelope::ping("alice@n1").unwrap();
        assert!(env.is_valid());
        env.version.clear();
        assert!(!env.is_valid());
    }

    #[test]
    fn error_requires_recipient() {
        let mut env = Envelope::error("n1", "alice@n1", "boom", Some("E42")).unwrap();
        assert!(env.is_valid());
        env.routing.recipient = None;
        assert!(!env.is_valid());
    }

    #[test]
    fn channel_constructor_needs_key_id_to_validate() {
        let env = Envelope::channel_message("alice@n1", "#general", "hi").unwrap();
        assert_eq!(env.header.message_type, MessageType::Message);
        assert_eq!(env.header.encryption_type, EncryptionType::Channel);
        assert!(!env.is_valid());

        let mut keyed = env;
        keyed.crypto.channel_key_id = Some("chan-key".into());
        assert!(keyed.is_valid());
    }

    #[test]
    fn join_and_leave_are_plain() {
        let join = Envelope::join("alice@n1", "#general").unwrap();
        let leave = Envelope::leave("alice@n1", "#general").unwrap();
        for env in [join, leave] {
            assert_eq!(env.header.encryption_type, EncryptionType::None);
            assert!(env.payload.data.is_empty());
            assert!(env.is_valid());
        }
    }

    #[test]
    fn constructors_reject_empty_arguments() {
        assert!(Envelope::channel_message("", "#general", "hi").is_err());
        assert!(Envelope::private_message("a@n", "", "hi").is_err());
        assert!(Envelope::join("a@n", "").is_err());
        assert!(Envelope::ping("  ").is_err());
        assert!(Envelope::error("a@n", "b@n", "", None).is_err());
    }

    #[test]
    fn fresh_ids_per_envelope() {
        let a = Envelope::ping("alice@n1").unwrap();
        let b = Envelope::ping("alice@n1").unwrap();
        assert_ne!(a.header.message_id, b.header.message_id);
        assert!(!a.payload.data.is_empty());
        assert!(a.header.timestamp > 0);
    }

    #[test]
    fn pong_echoes_ping() {
        let ping = Envelope::ping("alice@n1").unwrap();
        let pong = Envelope::pong("bob@n2", &ping).unwrap();
        assert_eq!(pong.header.message_type, MessageType::Pong);
        assert_eq!(pong.routing.recipient.as_deref(), Some("alice@n1"));
        assert_eq!(pong.payload.data, ping.payload.data);
        assert!(pong.is_valid());
    }

    #[test]
    fn pong_of_non_ping_fails() {
        let msg = Envelope::join("alice@n1", "#general").unwrap();
        let err = Envelope::pong("bob@n2", &msg).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }

    #[test]
    fn error_payload_is_json() {
        let env = Envelope::error("n1", "alice@n1", "no such user", Some("404")).unwrap();
        assert_eq!(env.payload.format, PayloadFormat::Json);
        let body: serde_json::Value = serde_json::from_str(&env.payload.data).unwrap();
        assert_eq!(body["message"], "no such user");
        assert_eq!(body["code"], "404");

        let no_code = Envelope::error("n1", "alice@n1", "oops", None).unwrap();
        let body: serde_json::Value = serde_json::from_str(&no_code.payload.data).unwrap();
        assert!(body["code"].is_null());
    }

    #[test]
    fn deep_clone_is_equal_and_independent() {
        let env = Envelope::builder("alice@n1", MessageType::Message)
            .channel("#general")
            .metadata("history", serde_json::json!(["n1:1"]))
            .build();
        let mut copy = env.deep_clone().unwrap();
        assert_eq!(copy, env);
        copy.routing
            .transport_metadata
            .insert("history".into(), serde_json::json!([]));
        assert_ne!(copy, env);
    }
}
