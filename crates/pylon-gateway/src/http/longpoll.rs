use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pylon_broker::PollOutcome;
use pylon_core::{PylonError, Result};
use pylon_protocol::validate::validate_channel;
use pylon_protocol::Reply;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Client watermark — highest id already processed.
    #[serde(default)]
    pub last: u64,
}

/// GET /channels/{chan1}|{chan2}?last=N — long-poll fallback transport.
///
/// Held open until the first matching message (200, single delivery body) or
/// `comet_timeout` (504, no payload — never an empty success, so the client
/// knows to reissue immediately). A disconnect mid-poll drops the waiter
/// handle, which deregisters it.
pub async fn poll_handler(
    Path(channels): Path<String>,
    Query(query): Query<PollQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let channels = match parse_channels(&channels, state.broker.max_subscriptions()) {
        Ok(chs) => chs,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(Reply::error(&e))).into_response();
        }
    };

    match state.broker.poll_wait(channels, query.last) {
        Err(e) => {
            // capacity: rejected without registering anything
            (StatusCode::SERVICE_UNAVAILABLE, Json(Reply::error(&e))).into_response()
        }
        Ok(PollOutcome::Immediate(msg)) => Json(msg.delivery()).into_response(),
        Ok(PollOutcome::Wait(handle)) => {
            match handle.wait(state.broker.comet_timeout()).await {
                Some(msg) => Json(msg.delivery()).into_response(),
                None => {
                    debug!("long-poll expired without a match");
                    StatusCode::GATEWAY_TIMEOUT.into_response()
                }
            }
        }
    }
}

/// Split the `|`-separated channel path segment and validate each name,
/// applying the same bounds as a set-filter command.
fn parse_channels(raw: &str, max_subscriptions: usize) -> Result<Vec<String>> {
    let channels: Vec<String> = raw
        .split('|')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if channels.is_empty() {
        return Err(PylonError::InvalidFilter(
            "no channels in path".to_string(),
        ));
    }
    if channels.len() > max_subscriptions {
        return Err(PylonError::TooManySubscriptions {
            count: channels.len(),
            max: max_subscriptions,
        });
    }
    for channel in &channels {
        validate_channel(channel)?;
    }
    Ok(channels)
}
