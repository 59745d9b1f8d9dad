use pylon_core::PylonError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → caller reply to a single command.
///
/// Wire: `{ "status": "success", "id": 42 }`
///       `{ "status": "error", "code": "invalid-channel", "message": "..." }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Reply {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Error { code: String, message: String },
}

impl Reply {
    pub fn success() -> Self {
        Reply::Success { id: None }
    }

    pub fn success_id(id: u64) -> Self {
        Reply::Success { id: Some(id) }
    }

    /// Map a domain error onto its wire shape — code from
    /// [`PylonError::code`], message from `Display`.
    pub fn error(err: &PylonError) -> Self {
        Reply::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }
}

/// Server → subscriber unsolicited push, one per delivered event.
///
/// Wire: `{ "id": 42, "channel": "chat", "message": {...} }` — delivered to
/// each connection in increasing-id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: u64,
    pub channel: String,
    pub message: Value,
}
