//! `local@server` identifiers and channel names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Prefix marking a channel address (`#general`, `##neptune`).
pub const CHANNEL_SIGIL: char = '#';

/// Longest accepted channel name, sigil included.
pub const MAX_CHANNEL_LEN: usize = 32;

/// A user or service address: `local@server`.
///
/// Parsing splits at the *first* `@`, so the server part may itself contain
/// `@` but the local part never does. Both halves must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NeptuneId {
    local: String,
    server: String,
}

impl NeptuneId {
    pub fn new(
        local: impl Into<String>,
        server: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let local = local.into();
        let server = server.into();
        if local.is_empty() || server.is_empty() || local.contains('@') {
            return Err(TransportError::InvalidId(format!("{local}@{server}")));
        }
        Ok(Self { local, server })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Returns true when this id is hosted on `node`.
    pub fn is_on(&self, node: &str) -> bool {
        self.server == node
    }
}

impl FromStr for NeptuneId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok(Self {
                local: local.to_owned(),
                server: server.to_owned(),
            }),
            _ => Err(TransportError::InvalidId(s.to_owned())),
        }
    }
}

impl fmt::Display for NeptuneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.server)
    }
}

impl TryFrom<String> for NeptuneId {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NeptuneId> for String {
    fn from(id: NeptuneId) -> Self {
        id.to_string()
    }
}

/// Join `local` and `server` into an address string.
pub fn format_id(local: &str, server: &str) -> Result<String, TransportError> {
    NeptuneId::new(local, server).map(|id| id.to_string())
}

/// Whether `to` addresses a channel rather than a user.
pub fn is_channel_address(to: &str) -> bool {
    to.starts_with(CHANNEL_SIGIL)
}

/// Channel names: one or two `#`, then at least one of `[A-Za-z0-9_-]`,
/// at most [`MAX_CHANNEL_LEN`] characters overall.
pub fn is_valid_channel_name(name: &str) -> bool {
    if name.len() < 2 || name.len() > MAX_CHANNEL_LEN {
        return false;
    }
    let body = match name.strip_prefix("##") {
        Some(rest) => rest,
        None => match name.strip_prefix(CHANNEL_SIGIL) {
            Some(rest) => rest,
            None => return false,
        },
    };
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Like [`is_valid_channel_name`] but as a configuration check.
pub fn require_channel_name(name: &str) -> Result<(), TransportError> {
    if is_valid_channel_name(name) {
        Ok(())
    } else {
        Err(TransportError::InvalidChannel(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_at_first_at() {
        let id: NeptuneId = "alice@node-1".parse().unwrap();
        assert_eq!(id.local(), "alice");
        assert_eq!(id.server(), "node-1");

        let odd: NeptuneId = "bob@relay@edge".parse().unwrap();
        assert_eq!(odd.local(), "bob");
        assert_eq!(odd.server(), "relay@edge");
        assert_eq!(odd.to_string(), "bob@relay@edge");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["alice", "@node", "alice@", "", "@"] {
            assert!(bad.parse::<NeptuneId>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn format_requires_both_parts() {
        assert_eq!(format_id("alice", "n1").unwrap(), "alice@n1");
        assert!(format_id("", "n1").is_err());
        assert!(format_id("alice", "").is_err());
    }

    #[test]
    fn serde_as_plain_string() {
        let id = NeptuneId::new("carol", "hub").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol@hub\"");
        let back: NeptuneId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<NeptuneId>("\"nobody\"").is_err());
    }

    #[test]
    fn channel_names() {
        assert!(is_valid_channel_name("#general"));
        assert!(is_valid_channel_name("##neptune"));
        assert!(is_valid_channel_name("#general-chat_123"));
        assert!(!is_valid_channel_name("general"));
        assert!(!is_valid_channel_name("#"));
        assert!(!is_valid_channel_name("##"));
        assert!(!is_valid_channel_name("#general!"));
        assert!(!is_valid_channel_name("#gen eral"));
        assert!(!is_valid_channel_name("###triple"));
    }

    #[test]
    fn channel_name_length_limit() {
        let ok = format!("#{}", "a".repeat(MAX_CHANNEL_LEN - 1));
        let too_long = format!("#{}", "a".repeat(MAX_CHANNEL_LEN));
        assert_eq!(too_long.len(), 33);
        assert!(is_valid_channel_name(&ok));
        assert!(!is_valid_channel_name(&too_long));
        assert!(require_channel_name(&too_long).is_err());
    }

    #[test]
    fn channel_addresses() {
        assert!(is_channel_address("#ops"));
        assert!(!is_channel_address("ops@node"));
    }
}
