/// Protocol-level errors for Neptune.
///
/// Wraps transport errors and adds the bus, crypto and storage failures
/// the dispatcher can run into.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] neptune_transport::TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            ProtocolError::Deserialization(e.to_string())
        } else {
            ProtocolError::Serialization(e.to_string())
        }
    }
}

impl From<lapin::Error> for ProtocolError {
    fn from(e: lapin::Error) -> Self {
        ProtocolError::Bus(e.to_string())
    }
}
