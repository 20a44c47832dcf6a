use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::pathvar::ArgvToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Assigned,
    Running,
    Canceling,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    /// Terminal states are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "pending" => Some(JobState::Pending),
            "assigned" => Some(JobState::Assigned),
            "running" => Some(JobState::Running),
            "canceling" => Some(JobState::Canceling),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up in `failed` (or was force-canceled). Stored on the job
/// row and surfaced on query; the stable tags are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WorkerLost,
    HeartbeatLost,
    NoEligibleWorker,
    ClientDisconnected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::WorkerLost => "worker_lost",
            FailureKind::HeartbeatLost => "heartbeat_lost",
            FailureKind::NoEligibleWorker => "no_eligible_worker",
            FailureKind::ClientDisconnected => "client_disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<FailureKind> {
        match s {
            "worker_lost" => Some(FailureKind::WorkerLost),
            "heartbeat_lost" => Some(FailureKind::HeartbeatLost),
            "no_eligible_worker" => Some(FailureKind::NoEligibleWorker),
            "client_disconnected" => Some(FailureKind::ClientDisconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active jobs require the submitting client to keep heartbeating; detached
/// jobs run to completion regardless of whether the client sticks around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Active,
    Detached,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Active => "active",
            JobMode::Detached => "detached",
        }
    }

    pub fn parse(s: &str) -> Option<JobMode> {
        match s {
            "active" => Some(JobMode::Active),
            "detached" => Some(JobMode::Detached),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<WorkerStatus> {
        match s {
            "online" => Some(WorkerStatus::Online),
            "offline" => Some(WorkerStatus::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Worker,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Worker => "worker",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "client" => Some(Role::Client),
            "worker" => Some(Role::Worker),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<LogStream> {
        match s {
            "stdout" => Some(LogStream::Stdout),
            "stderr" => Some(LogStream::Stderr),
            _ => None,
        }
    }
}

/// One authenticated peer. Created and mutated by the admin CLI only; the
/// API path never writes identities.
#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub role: Role,
    /// Base64 of the HMAC key, possibly encrypted (see `key_id`).
    pub hmac_key_stored: String,
    /// Key-ring entry that encrypted `hmac_key_stored`; `None` = plaintext.
    pub key_id: Option<String>,
    pub allowed_cidrs: Vec<IpNet>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub registration_interval_s: u32,
    pub version: String,
    pub advertised_binaries: BTreeSet<String>,
    pub advertised_variables: BTreeSet<String>,
    pub transport_choice: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Ulid,
    pub submitter_id: String,
    pub assignee_id: Option<String>,
    pub state: JobState,
    pub binary: String,
    pub argv: Vec<ArgvToken>,
    /// Derived from `argv` at submit time; a worker is eligible iff it
    /// advertises every variable in this set.
    pub required_variables: BTreeSet<String>,
    pub mode: JobMode,
    pub transport_choice: Option<String>,
    pub heartbeat_interval_s: u32,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Active-mode only: the last time the submitting client checked in.
    pub client_last_seen_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_kind: Option<FailureKind>,
    /// Whether any scheduler pass has ever observed a worker that could run
    /// this job. Never exposed on the wire.
    pub ever_eligible: bool,
}

impl Job {
    /// A fresh pending job as created by submit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Ulid,
        submitter_id: String,
        binary: String,
        argv: Vec<ArgvToken>,
        required_variables: BTreeSet<String>,
        mode: JobMode,
        transport_choice: Option<String>,
        heartbeat_interval_s: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            submitter_id,
            assignee_id: None,
            state: JobState::Pending,
            binary,
            argv,
            required_variables,
            mode,
            transport_choice,
            heartbeat_interval_s,
            created_at: now,
            state_entered_at: now,
            assigned_at: None,
            started_at: None,
            ended_at: None,
            last_heartbeat_at: None,
            client_last_seen_at: match mode {
                JobMode::Active => Some(now),
                JobMode::Detached => None,
            },
            exit_code: None,
            failure_kind: None,
            ever_eligible: false,
        }
    }
}

/// One appended log line. `seq` is dense per job, starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_id: Ulid,
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkKind {
    JobAssigned,
    JobCanceled,
    JobStateChanged,
    LogAppend,
    Ping,
}

impl DownlinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownlinkKind::JobAssigned => "job_assigned",
            DownlinkKind::JobCanceled => "job_canceled",
            DownlinkKind::JobStateChanged => "job_state_changed",
            DownlinkKind::LogAppend => "log_append",
            DownlinkKind::Ping => "ping",
        }
    }

    pub fn parse(s: &str) -> Option<DownlinkKind> {
        match s {
            "job_assigned" => Some(DownlinkKind::JobAssigned),
            "job_canceled" => Some(DownlinkKind::JobCanceled),
            "job_state_changed" => Some(DownlinkKind::JobStateChanged),
            "log_append" => Some(DownlinkKind::LogAppend),
            "ping" => Some(DownlinkKind::Ping),
            _ => None,
        }
    }
}

/// Whether a notification is addressed to a worker or to a submitting
/// client. Broker transports key their topic / routing-key shape off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkAudience {
    Worker,
    Client,
}

/// A queued notification for a peer. Persisted only for the http_polling
/// transport; broker transports publish and forget.
#[derive(Debug, Clone)]
pub struct DownlinkMessage {
    pub message_id: Ulid,
    pub recipient_id: String,
    pub kind: DownlinkKind,
    /// Job the notification concerns, when there is one.
    pub job_id: Option<Ulid>,
    pub audience: DownlinkAudience,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DownlinkMessage {
    pub fn to_worker(
        worker_id: impl Into<String>,
        kind: DownlinkKind,
        job_id: Option<Ulid>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Ulid::new(),
            recipient_id: worker_id.into(),
            kind,
            job_id,
            audience: DownlinkAudience::Worker,
            payload,
            created_at: now,
            delivered_at: None,
        }
    }

    pub fn to_client(
        client_id: impl Into<String>,
        kind: DownlinkKind,
        job_id: Option<Ulid>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Ulid::new(),
            recipient_id: client_id.into(),
            kind,
            job_id,
            audience: DownlinkAudience::Client,
            payload,
            created_at: now,
            delivered_at: None,
        }
    }
}
