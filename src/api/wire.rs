//! Wire shapes for the REST surface.
//!
//! These are deliberately separate from the storage rows in `model`;
//! conversion happens at the handler boundary and storage-only fields
//! (ever_eligible, client_last_seen_at) never leak out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FailureKind, Job, JobMode, JobState, LogChunk, LogStream};
use crate::pathvar::ArgvToken;
use crate::transport::DownlinkEnvelope;

/// Ordered transport preference, as sent by peers on register/submit.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportPreference {
    pub enabled: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub binary: String,
    pub argv: Vec<ArgvToken>,
    #[serde(default)]
    pub mode: Option<JobMode>,
    #[serde(default)]
    pub heartbeat_interval_s: Option<u32>,
    #[serde(default)]
    pub transports: Option<TransportPreference>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub state: JobState,
    pub transport: TransportChoice,
}

#[derive(Debug, Serialize)]
pub struct TransportChoice {
    pub chosen: String,
}

#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub submitter_id: String,
    pub assignee_id: Option<String>,
    pub binary: String,
    pub argv: Vec<ArgvToken>,
    pub required_variables: Vec<String>,
    pub mode: JobMode,
    pub heartbeat_interval_s: u32,
    pub exit_code: Option<i32>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            state: job.state,
            submitter_id: job.submitter_id.clone(),
            assignee_id: job.assignee_id.clone(),
            binary: job.binary.clone(),
            argv: job.argv.clone(),
            required_variables: job.required_variables.iter().cloned().collect(),
            mode: job.mode,
            heartbeat_interval_s: job.heartbeat_interval_s,
            exit_code: job.exit_code,
            failure_kind: job.failure_kind,
            created_at: job.created_at,
            assigned_at: job.assigned_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            detail: None,
        }
    }

    pub fn ok_with(detail: impl Into<String>) -> Self {
        Self {
            status: "ok",
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub registration_interval_s: u32,
    #[serde(default)]
    pub version: String,
    pub binaries: Vec<String>,
    pub variables: Vec<String>,
    #[serde(default)]
    pub transports: Option<TransportPreference>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub chosen: String,
}

#[derive(Debug, Serialize)]
pub struct WorkItem {
    pub job_id: String,
    pub state: JobState,
    pub binary: String,
    pub argv: Vec<ArgvToken>,
    pub heartbeat_interval_s: u32,
}

impl WorkItem {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            state: job.state,
            binary: job.binary.clone(),
            argv: job.argv.clone(),
            heartbeat_interval_s: job.heartbeat_interval_s,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkResponse {
    pub jobs: Vec<WorkItem>,
}

#[derive(Debug, Deserialize)]
pub struct LogLineIn {
    pub stream: LogStream,
    pub text: String,
    #[serde(default)]
    pub emitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct LogAppendRequest {
    pub lines: Vec<LogLineIn>,
}

#[derive(Debug, Serialize)]
pub struct LogAppendResponse {
    pub first_seq: u64,
    pub last_seq: u64,
}

#[derive(Debug, Serialize)]
pub struct LogLineOut {
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
    pub emitted_at: DateTime<Utc>,
}

impl LogLineOut {
    pub fn from_chunk(chunk: &LogChunk) -> Self {
        Self {
            seq: chunk.seq,
            stream: chunk.stream,
            text: chunk.text.clone(),
            emitted_at: chunk.emitted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<LogLineOut>,
    /// Pass back as `since_seq` to continue from here.
    pub last_seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub exit_code: i32,
}

#[derive(Debug, Serialize)]
pub struct DownlinkResponse {
    pub messages: Vec<DownlinkEnvelope>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
