//! Hop and loop policy for forwarding relay messages.
//!
//! Pure decision logic: given a relay message and this node's name, either
//! produce the message to put on the wire or say why it must be dropped.
use std::fmt;

use neptune_transport::RelayMessage;

/// Why a relayed message was not delivered or forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// `hops` already reached `max_hops`.
    HopLimit { hops: u32, max_hops: u32 },
    /// This node already appears in `history`.
    Loop,
    /// Addressed to a user this node does not host.
    UnknownRecipient,
    /// No registered transport accepted the forward.
    Undeliverable,
    /// Seen this message id recently.
    Duplicate,
    /// Could not be decrypted, decoded or addressed.
    Malformed(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::HopLimit { hops, max_hops } => {
                write!(f, "hop limit reached ({hops}/{max_hops})")
            }
            DropReason::Loop => f.write_str("routing loop"),
            DropReason::UnknownRecipient => f.write_str("unknown recipient"),
            DropReason::Undeliverable => f.write_str("no transport accepted the message"),
            DropReason::Duplicate => f.write_str("duplicate"),
            DropReason::Malformed(why) => write!(f, "malformed: {why}"),
        }
    }
}

/// `"<node>:<unix secs>"` history entry.
pub fn history_entry(node: &str, now_secs: u64) -> String {
    format!("{node}:{now_secs}")
}

/// Next-hop copy of `msg`: one more hop, this node appended to `history`.
///
/// Refuses when this node is already in `history` or when another hop
/// would exceed `max_hops`. A message that returns is never forwarded.
pub fn prepare_forward(
    msg: &RelayMessage,
    local_node: &str,
    now_secs: u64,
) -> Result<RelayMessage, DropReason> {
    if msg.has_visited(local_node) {
        return Err(DropReason::Loop);
    }
    if msg.hops >= msg.max_hops {
        return Err(DropReason::HopLimit {
            hops: msg.hops,
            max_hops: msg.max_hops,
        });
    }
    let mut next = msg.clone();
    next.hops += 1;
    next.history.push(history_entry(local_node, now_secs));
    Ok(next)
}
