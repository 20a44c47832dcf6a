//! The REST surface consumed by clients and workers.
//!
//! Every route under /api/v1 goes through the HMAC auth middleware; role
//! and ownership checks live in the handlers.

pub mod auth_layer;
pub mod downlink;
pub mod health;
pub mod jobs;
pub mod wire;
pub mod workers;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::RequestVerifier;
use crate::config::{ApiConfig, JobsConfig};
use crate::repo::Repository;
use crate::scheduler::SchedulerHandle;
use crate::transport::{DownlinkWaiters, TransportRegistry};

#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub verifier: Arc<RequestVerifier>,
    pub transports: Arc<TransportRegistry>,
    pub waiters: Arc<DownlinkWaiters>,
    pub scheduler: SchedulerHandle,
    pub jobs_config: Arc<JobsConfig>,
    pub api_config: Arc<ApiConfig>,
}

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/v1/jobs", post(jobs::submit).get(jobs::list))
        .route("/api/v1/jobs/{id}", get(jobs::get))
        .route("/api/v1/jobs/{id}/cancel", post(jobs::cancel))
        .route("/api/v1/jobs/{id}/heartbeat", post(jobs::client_heartbeat))
        .route("/api/v1/jobs/{id}/accept", post(jobs::accept))
        .route(
            "/api/v1/jobs/{id}/log",
            post(jobs::append_log).get(jobs::get_logs),
        )
        .route("/api/v1/jobs/{id}/progress", post(jobs::progress))
        .route("/api/v1/jobs/{id}/complete", post(jobs::complete))
        .route("/api/v1/workers/register", post(workers::register))
        .route("/api/v1/workers/{id}/work", get(workers::work))
        .route("/api/v1/downlink", get(downlink::drain))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_layer::require_auth,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
