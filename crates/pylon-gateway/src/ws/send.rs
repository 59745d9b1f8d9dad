use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use pylon_core::{PylonError, Result};

pub type WsSink = SplitSink<WebSocket, Message>;

/// Serialize a frame to JSON and push it down the socket. A send failure
/// means the peer is gone; callers tear the connection down on error.
pub async fn json<T: serde::Serialize>(tx: &mut WsSink, payload: &T) -> Result<()> {
    let frame = serde_json::to_string(payload)?;
    tx.send(Message::Text(frame.into()))
        .await
        .map_err(|e| PylonError::Internal(e.to_string()))
}
