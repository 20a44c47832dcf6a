//! Unauthenticated liveness probe.

use axum::Json;

use crate::api::wire::HealthResponse;

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
