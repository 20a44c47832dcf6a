//! Job routes: submission and queries on the client side, the job
//! lifecycle (accept/log/progress/complete) on the worker side.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use ulid::Ulid;

use crate::api::wire::{
    CommandResponse, CompleteRequest, JobListResponse, JobSnapshot, LogAppendRequest,
    LogAppendResponse, LogLineOut, LogsResponse, ProgressRequest, SubmitJobRequest,
    SubmitJobResponse, TransportChoice,
};
use crate::api::AppState;
use crate::auth::AuthedPeer;
use crate::error::ApiError;
use crate::model::{DownlinkKind, DownlinkMessage, Job, JobMode, JobState, Role};
use crate::pathvar::required_variables;
use crate::repo::{with_storage_retries, JobFilter, NewLogLine, TransitionUpdate};
use crate::transport::{job_state_payload, HTTP_POLLING};

pub async fn submit(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    peer.require_role(Role::Client)?;

    if !state.jobs_config.allowed_binaries.contains(&req.binary) {
        return Err(ApiError::Validation(format!(
            "binary {:?} is not allowed",
            req.binary
        )));
    }
    let required = required_variables(&req.argv)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let chosen = match &req.transports {
        Some(preference) => state.transports.negotiate(&preference.enabled)?,
        None => HTTP_POLLING.to_string(),
    };

    let job = Job::new(
        Ulid::new(),
        peer.client_id.clone(),
        req.binary,
        req.argv,
        required,
        req.mode.unwrap_or(JobMode::Active),
        Some(chosen.clone()),
        req.heartbeat_interval_s
            .unwrap_or(state.jobs_config.default_heartbeat_interval_s),
        Utc::now(),
    );
    let job_id = job.job_id;

    with_storage_retries(state.api_config.storage_retry_attempts, || {
        state.repo.jobs_submit(job.clone())
    })
    .await?;

    tracing::info!(job_id = %job_id, submitter = %peer.client_id, binary = %job.binary,
        "job submitted");
    state.scheduler.wake();

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job_id.to_string(),
            state: JobState::Pending,
            transport: TransportChoice { chosen },
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub before_id: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Query(params): Query<ListParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    peer.require_role(Role::Client)?;

    let before_id = params
        .before_id
        .as_deref()
        .map(parse_job_id)
        .transpose()?;
    let filter = JobFilter {
        // Admins see every submitter's jobs.
        submitter: (!peer.is_admin()).then(|| peer.client_id.clone()),
        before_id,
        limit: Some(params.limit.unwrap_or(20).min(200)),
        ended_after: Some(Utc::now() - chrono::Duration::hours(1)),
        ..JobFilter::default()
    };
    let jobs = state.repo.jobs_query(&filter).await?;
    Ok(Json(JobListResponse {
        jobs: jobs.iter().map(JobSnapshot::from_job).collect(),
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = load_job(&state, &id).await?;
    authorize_view(&peer, &job)?;
    Ok(Json(JobSnapshot::from_job(&job)))
}

/// Cancel is terminal-safe: pending cancels immediately, assigned/running
/// become canceling and the worker is told to stop, finished jobs no-op.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let job = load_job(&state, &id).await?;
    if job.submitter_id != peer.client_id && !peer.is_admin() {
        return Err(ApiError::Forbidden("not the submitter of this job".to_string()));
    }

    if job.state.is_terminal() {
        return Ok(Json(CommandResponse::ok_with("job already finished")));
    }

    let now = Utc::now();
    match job.state {
        JobState::Canceling => {
            return Ok(Json(CommandResponse::ok_with("job already canceling")));
        }
        JobState::Pending => {
            let updated = state
                .repo
                .job_transition(
                    job.job_id,
                    &[JobState::Pending],
                    JobState::Canceled,
                    TransitionUpdate::default(),
                    now,
                )
                .await?;
            notify_submitter(&state, &updated).await;
        }
        JobState::Assigned | JobState::Running => {
            let updated = state
                .repo
                .job_transition(
                    job.job_id,
                    &[JobState::Assigned, JobState::Running],
                    JobState::Canceling,
                    TransitionUpdate::default(),
                    now,
                )
                .await?;
            notify_submitter(&state, &updated).await;
            if let Some(worker_id) = updated.assignee_id.clone() {
                let choice = worker_choice(&state, &worker_id).await;
                state
                    .transports
                    .deliver(
                        choice.as_deref(),
                        DownlinkMessage::to_worker(
                            worker_id,
                            DownlinkKind::JobCanceled,
                            Some(updated.job_id),
                            job_state_payload(&updated),
                            now,
                        ),
                    )
                    .await;
            }
        }
        // Terminal states returned above.
        JobState::Completed | JobState::Failed | JobState::Canceled => {}
    }

    tracing::info!(job_id = %job.job_id, by = %peer.client_id, "job cancel requested");
    Ok(Json(CommandResponse::ok()))
}

/// Client-side heartbeat for active-mode jobs. Detached jobs accept it as a
/// no-op so clients can attach later.
pub async fn client_heartbeat(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let job = load_job(&state, &id).await?;
    if job.submitter_id != peer.client_id && !peer.is_admin() {
        return Err(ApiError::Forbidden("not the submitter of this job".to_string()));
    }
    if job.state.is_terminal() {
        return Ok(Json(CommandResponse::ok_with("job already finished")));
    }
    state.repo.job_client_heartbeat(job.job_id, Utc::now()).await?;
    Ok(Json(CommandResponse::ok()))
}

/// Worker takes ownership of an assignment: assigned → running.
pub async fn accept(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    let job = load_job(&state, &id).await?;
    authorize_assignee(&peer, &job)?;

    let updated = state
        .repo
        .job_transition(
            job.job_id,
            &[JobState::Assigned],
            JobState::Running,
            TransitionUpdate::default(),
            Utc::now(),
        )
        .await?;
    tracing::info!(job_id = %job.job_id, worker_id = %peer.client_id, "job accepted");
    notify_submitter(&state, &updated).await;
    Ok(Json(CommandResponse::ok()))
}

pub async fn append_log(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
    Json(req): Json<LogAppendRequest>,
) -> Result<Json<LogAppendResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    let job = load_job(&state, &id).await?;
    authorize_assignee(&peer, &job)?;
    if req.lines.is_empty() {
        return Err(ApiError::Validation("log batch must not be empty".to_string()));
    }

    let now = Utc::now();
    let lines: Vec<NewLogLine> = req
        .lines
        .into_iter()
        .map(|line| NewLogLine {
            stream: line.stream,
            text: line.text,
            emitted_at: line.emitted_at.unwrap_or(now),
        })
        .collect();

    let (first_seq, last_seq) = with_storage_retries(state.api_config.storage_retry_attempts, {
        let repo = state.repo.clone();
        let lines = lines.clone();
        move || {
            let repo = repo.clone();
            let lines = lines.clone();
            async move { repo.job_append_log(job.job_id, lines).await }
        }
    })
    .await?;

    // A worker shipping logs is alive; count it as a heartbeat.
    if let Err(e) = state.repo.job_heartbeat(job.job_id, now).await {
        tracing::debug!(job_id = %job.job_id, error = %e, "heartbeat alongside log append failed");
    }

    let payload = serde_json::json!({
        "job_id": job.job_id.to_string(),
        "first_seq": first_seq,
        "last_seq": last_seq,
    });
    state
        .transports
        .deliver(
            job.transport_choice.as_deref(),
            DownlinkMessage::to_client(
                &job.submitter_id,
                DownlinkKind::LogAppend,
                Some(job.job_id),
                payload,
                now,
            ),
        )
        .await;

    Ok(Json(LogAppendResponse { first_seq, last_seq }))
}

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    pub since_seq: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogsResponse>, ApiError> {
    let job = load_job(&state, &id).await?;
    authorize_view(&peer, &job)?;

    let chunks = state
        .repo
        .job_logs(job.job_id, params.since_seq, params.limit)
        .await?;
    let last_seq = chunks.last().map(|chunk| chunk.seq);
    Ok(Json(LogsResponse {
        lines: chunks.iter().map(LogLineOut::from_chunk).collect(),
        last_seq,
    }))
}

/// Worker heartbeat with optional structured progress.
pub async fn progress(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
    Json(req): Json<ProgressRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    let job = load_job(&state, &id).await?;
    authorize_assignee(&peer, &job)?;

    let now = Utc::now();
    state.repo.job_heartbeat(job.job_id, now).await?;
    if let Err(e) = state.repo.worker_heartbeat(&peer.client_id, now).await {
        tracing::debug!(worker_id = %peer.client_id, error = %e, "worker heartbeat failed");
    }

    if let Some(progress) = req.progress {
        let payload = serde_json::json!({
            "job_id": job.job_id.to_string(),
            "state": job.state.as_str(),
            "progress": progress,
        });
        state
            .transports
            .deliver(
                job.transport_choice.as_deref(),
                DownlinkMessage::to_client(
                    &job.submitter_id,
                    DownlinkKind::JobStateChanged,
                    Some(job.job_id),
                    payload,
                    now,
                ),
            )
            .await;
    }
    Ok(Json(CommandResponse::ok()))
}

/// Terminal report from the worker. Exit code 0 completes the job, anything
/// else fails it; a job that was canceling lands in canceled either way.
pub async fn complete(
    State(state): State<AppState>,
    Extension(peer): Extension<AuthedPeer>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    peer.require_role(Role::Worker)?;
    let job = load_job(&state, &id).await?;
    authorize_assignee(&peer, &job)?;

    let to = match job.state {
        JobState::Canceling => JobState::Canceled,
        _ if req.exit_code == 0 => JobState::Completed,
        _ => JobState::Failed,
    };
    let update = TransitionUpdate {
        exit_code: Some(req.exit_code),
        ..TransitionUpdate::default()
    };

    let updated = state
        .repo
        .job_transition(
            job.job_id,
            &[JobState::Assigned, JobState::Running, JobState::Canceling],
            to,
            update,
            Utc::now(),
        )
        .await?;

    tracing::info!(
        job_id = %job.job_id,
        worker_id = %peer.client_id,
        exit_code = req.exit_code,
        state = %updated.state,
        "job finished"
    );
    notify_submitter(&state, &updated).await;
    // Capacity freed; let the scheduler look for work.
    state.scheduler.wake();
    Ok(Json(CommandResponse::ok()))
}

// --- shared helpers ----------------------------------------------------

pub(crate) fn parse_job_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw).map_err(|_| ApiError::Validation(format!("invalid job id: {raw:?}")))
}

async fn load_job(state: &AppState, raw_id: &str) -> Result<Job, ApiError> {
    let job_id = parse_job_id(raw_id)?;
    state
        .repo
        .job_get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
}

fn authorize_view(peer: &AuthedPeer, job: &Job) -> Result<(), ApiError> {
    let owns = job.submitter_id == peer.client_id
        || job.assignee_id.as_deref() == Some(peer.client_id.as_str());
    if owns || peer.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("no access to this job".to_string()))
    }
}

fn authorize_assignee(peer: &AuthedPeer, job: &Job) -> Result<(), ApiError> {
    if job.assignee_id.as_deref() == Some(peer.client_id.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not assigned to this job".to_string()))
    }
}

async fn worker_choice(state: &AppState, worker_id: &str) -> Option<String> {
    match state.repo.worker_get(worker_id).await {
        Ok(Some(worker)) => worker.transport_choice,
        _ => None,
    }
}

async fn notify_submitter(state: &AppState, job: &Job) {
    state
        .transports
        .deliver(
            job.transport_choice.as_deref(),
            DownlinkMessage::to_client(
                &job.submitter_id,
                DownlinkKind::JobStateChanged,
                Some(job.job_id),
                job_state_payload(job),
                Utc::now(),
            ),
        )
        .await;
}
