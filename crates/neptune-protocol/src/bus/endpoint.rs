use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::ProtocolError;

/// Queue used when a broker URL names none.
pub const DEFAULT_QUEUE: &str = "neptune.relay";

/// Where the message bus lives, parsed from a connection string:
///
/// - `internal://<name>`: in-process, single node
/// - `rabbitmq://<host>:<port>[/<queue>]`: durable broker queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    Internal { name: String },
    RabbitMq { host: String, port: u16, queue: String },
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl BusEndpoint {
    pub fn parse(connection: &str) -> Result<Self, ProtocolError> {
        let bad = |why: &str| ProtocolError::Config(format!("bus url {connection:?}: {why}"));
        let url = Url::parse(connection.trim()).map_err(|e| bad(&e.to_string()))?;

        match url.scheme() {
            "internal" => {
                let name = url.host_str().unwrap_or_default();
                if !valid_segment(name) || url.port().is_some() || !matches!(url.path(), "" | "/") {
                    return Err(bad("expected internal://<name>"));
                }
                Ok(BusEndpoint::Internal { name: name.to_owned() })
            }
            "rabbitmq" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| bad("missing host"))?;
                let port = url.port().ok_or_else(|| bad("missing port"))?;
                let queue = match url.path().trim_start_matches('/') {
                    "" => DEFAULT_QUEUE.to_owned(),
                    q if valid_segment(q) => q.to_owned(),
                    q => return Err(bad(&format!("invalid queue name {q:?}"))),
                };
                Ok(BusEndpoint::RabbitMq {
                    host: host.to_owned(),
                    port,
                    queue,
                })
            }
            other => Err(ProtocolError::Config(format!("unsupported bus scheme {other:?}"))),
        }
    }

    /// AMQP URI for the broker (default vhost).
    pub fn amqp_uri(&self) -> Option<String> {
        match self {
            BusEndpoint::RabbitMq { host, port, .. } => Some(format!("amqp://{host}:{port}/%2f")),
            BusEndpoint::Internal { .. } => None,
        }
    }
}

impl FromStr for BusEndpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEndpoint::Internal { name } => write!(f, "internal://{name}"),
            BusEndpoint::RabbitMq { host, port, queue } => {
                write!(f, "rabbitmq://{host}:{port}/{queue}")
            }
        }
    }
}
