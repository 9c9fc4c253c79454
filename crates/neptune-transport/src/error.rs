/// Errors returned by the Neptune transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport {transport_id} failed to start: {reason}")]
    Start { transport_id: String, reason: String },

    #[error("transport {transport_id} failed to stop cleanly: {reason}")]
    Stop { transport_id: String, reason: String },

    #[error("send of message {message_id} failed: {reason}")]
    Send { message_id: String, reason: String },

    #[error("peer discovery on {transport_id} failed: {reason}")]
    PeerDiscovery { transport_id: String, reason: String },

    #[error("transport {0} is not active")]
    NotActive(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}
