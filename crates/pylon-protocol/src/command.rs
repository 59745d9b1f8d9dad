use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection role — fixed at handshake, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Trusted, token-authenticated. May publish and query the id counter.
    Sender,
    /// Anonymous. May subscribe and query, never publish.
    Client,
}

/// Inbound command — a closed tagged union decoded up front.
///
/// Unknown command names fail deserialization and surface as a single
/// `bad-command` validation branch rather than a silent no-op.
///
/// Wire: `{ "command": "post", "channel": "chat", "message": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Publish a payload on a channel (sender only).
    Post { channel: String, message: Value },
    /// Set the connection's watermark baseline for catch-up replay.
    StartMsg { start: u64 },
    /// Replace the connection's channel subscriptions (full replacement,
    /// not additive union).
    SetFilter { filter: Vec<String> },
    /// Query the id of the most recent post.
    LastMsg,
}

impl Command {
    /// Command name as it appears on the wire, for logging and error text.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Post { .. } => "post",
            Command::StartMsg { .. } => "start-msg",
            Command::SetFilter { .. } => "set-filter",
            Command::LastMsg => "last-msg",
        }
    }
}
