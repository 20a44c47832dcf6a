//! The downlink drain endpoint: the peer side of the http_polling
//! transport. Any authenticated peer long-polls its own queue.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::wire::DownlinkResponse;
use crate::api::AppState;
use crate::auth::AuthedPeer;
use crate::error::ApiError;
use crate::transport::DownlinkEnvelope;

const DEFAULT_MAX_MESSAGES: usize = 64;

#[derive(Debug, Deserialize)]
pub struct DrainParams {
    #[serde(default)]
    pub max: Option<usize>,
    #[serde(default)]
    pub wait_s: Option<u64>,
}

pub async fn drain(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Query(params): Query<DrainParams>,
) -> Result<Json<DownlinkResponse>, ApiError> {
    let max = params.max.unwrap_or(DEFAULT_MAX_MESSAGES).clamp(1, 256);
    let wait = Duration::from_secs(
        params
            .wait_s
            .unwrap_or(state.api_config.long_poll_wait_s)
            .min(state.api_config.long_poll_wait_s),
    );

    let messages = state
        .transports
        .http_polling()
        .wait_for_messages(&peer.client_id, max, wait)
        .await?;

    Ok(Json(DownlinkResponse {
        messages: messages.iter().map(DownlinkEnvelope::from_message).collect(),
    }))
}
