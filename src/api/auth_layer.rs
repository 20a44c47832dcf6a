//! Authentication middleware.
//!
//! Buffers the request body (signatures cover the raw bytes), verifies the
//! HMAC headers against the identity store, and stashes the verified peer in
//! the request extensions for handlers to authorize on.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use crate::api::AppState;
use crate::auth::{HEADER_CLIENT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::error::ApiError;

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();

    let bytes = axum::body::to_bytes(body, state.api_config.max_body_bytes)
        .await
        .map_err(|_| ApiError::Validation("request body too large or unreadable".to_string()))?;

    let peer_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    // The signature covers the path including the query string.
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    let peer = state
        .verifier
        .verify(
            parts.method.as_str(),
            path_and_query,
            header(&parts.headers, HEADER_CLIENT_ID),
            header(&parts.headers, HEADER_TIMESTAMP),
            header(&parts.headers, HEADER_SIGNATURE),
            &bytes,
            peer_ip,
            header(&parts.headers, "x-forwarded-for"),
            Utc::now(),
        )
        .await?;

    parts.extensions.insert(peer);
    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
