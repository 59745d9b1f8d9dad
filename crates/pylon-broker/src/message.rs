use pylon_protocol::Delivery;
use serde_json::Value;

/// A published event. Immutable once created; destroyed only by eviction
/// from the replay buffer.
#[derive(Debug, Clone)]
pub struct Message {
    /// Globally monotonic — one counter for all channels.
    pub id: u64,
    pub channel: String,
    pub payload: Value,
}

impl Message {
    /// The outbound wire frame for this message.
    pub fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            channel: self.channel.clone(),
            message: self.payload.clone(),
        }
    }
}
