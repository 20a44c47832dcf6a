//! Worker routes: registration (doubling as the worker-level heartbeat) and
//! the long-poll work fetch.

use std::collections::BTreeSet;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::api::wire::{RegisterRequest, RegisterResponse, WorkItem, WorkResponse};
use crate::api::AppState;
use crate::auth::AuthedPeer;
use crate::error::ApiError;
use crate::model::{JobState, Role};
use crate::repo::{with_storage_retries, WorkerRegistration};
use crate::transport::HTTP_POLLING;

/// Register (or re-register) a worker. Idempotent; re-registration is the
/// worker-level heartbeat. Returns the negotiated transport.
pub async fn register(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    if req.worker_id != peer.client_id {
        return Err(ApiError::Forbidden(
            "worker_id does not match authenticated client".to_string(),
        ));
    }
    if req.registration_interval_s == 0 {
        return Err(ApiError::Validation(
            "registration_interval_s must be positive".to_string(),
        ));
    }

    let chosen = match &req.transports {
        Some(preference) => state.transports.negotiate(&preference.enabled)?,
        None => HTTP_POLLING.to_string(),
    };

    let reg = WorkerRegistration {
        worker_id: req.worker_id,
        registration_interval_s: req.registration_interval_s,
        version: req.version,
        advertised_binaries: req.binaries.into_iter().collect::<BTreeSet<_>>(),
        advertised_variables: req.variables.into_iter().collect::<BTreeSet<_>>(),
        transport_choice: Some(chosen.clone()),
    };

    with_storage_retries(state.api_config.storage_retry_attempts, {
        let repo = state.repo.clone();
        let reg = reg.clone();
        move || {
            let repo = repo.clone();
            let reg = reg.clone();
            async move { repo.worker_register(reg, Utc::now()).await }
        }
    })
    .await?;

    tracing::info!(worker_id = %peer.client_id, transport = %chosen, "worker registered");
    // A worker coming online may unblock pending jobs.
    state.scheduler.wake();

    Ok(Json(RegisterResponse { chosen }))
}

#[derive(Debug, Deserialize)]
pub struct WorkParams {
    #[serde(default)]
    pub wait_s: Option<u64>,
}

/// Long-poll for assigned jobs. Blocks until an assignment lands or the
/// deadline passes; disconnecting releases the wait without side effects.
pub async fn work(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
    Query(params): Query<WorkParams>,
) -> Result<Json<WorkResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    if id != peer.client_id && !peer.is_admin() {
        return Err(ApiError::Forbidden(
            "cannot poll work for another worker".to_string(),
        ));
    }

    // Polling proves liveness.
    state.repo.worker_heartbeat(&id, Utc::now()).await?;

    let wait = Duration::from_secs(
        params
            .wait_s
            .unwrap_or(state.api_config.long_poll_wait_s)
            .min(state.api_config.long_poll_wait_s),
    );
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let waiter = state.waiters.waiter(&id);
        let notified = waiter.notified();

        let jobs = state
            .repo
            .jobs_for_worker_in(&id, &[JobState::Assigned])
            .await?;
        if !jobs.is_empty() {
            return Ok(Json(WorkResponse {
                jobs: jobs.iter().map(WorkItem::from_job).collect(),
            }));
        }

        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(Json(WorkResponse { jobs: Vec::new() }));
            }
        }
    }
}
