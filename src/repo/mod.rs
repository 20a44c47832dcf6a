//! Repository layer: durable storage of jobs, workers, identities, logs and
//! downlink messages.
//!
//! The engine set is a compile-time registry: each engine is a value behind
//! the [`Repository`] enum, selected once at startup. Every operation is a
//! small transactional contract, not a generic ORM surface; all writes that
//! read-then-write are either executed under a single engine lock (memory)
//! or expressed as conditional updates checked by affected-row count
//! (sqlite).

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::error::ApiError;
use crate::model::{
    DownlinkMessage, FailureKind, Identity, Job, JobState, LogChunk, LogStream, Worker,
    WorkerStatus,
};

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// A conditional update lost a race: the row was not in any of the
    /// expected source states.
    #[error("conflict on job {0}")]
    Conflict(Ulid),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("storage: {0}")]
    Storage(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => ApiError::NotFound(what),
            RepoError::UnknownWorker(id) => ApiError::NotFound(format!("worker {id}")),
            RepoError::Conflict(job_id) => {
                ApiError::Conflict(format!("job {job_id} changed state concurrently"))
            }
            RepoError::Serialization(detail) => ApiError::Internal(detail),
            RepoError::Storage(_) => ApiError::TransientStorage,
        }
    }
}

/// What the scheduler knows about one online worker when it asks for an
/// assignment. Candidates arrive pre-sorted by the scheduler's tie-break
/// order (fewest running jobs, then worker_id).
#[derive(Debug, Clone)]
pub struct WorkerCandidate {
    pub worker_id: String,
    pub binaries: BTreeSet<String>,
    pub variables: BTreeSet<String>,
    pub running: usize,
}

impl WorkerCandidate {
    /// Can this worker run the job at all, ignoring its current load?
    pub fn can_run(&self, binary: &str, required: &BTreeSet<String>) -> bool {
        self.binaries.contains(binary) && required.is_subset(&self.variables)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: Ulid,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub registration_interval_s: u32,
    pub version: String,
    pub advertised_binaries: BTreeSet<String>,
    pub advertised_variables: BTreeSet<String>,
    pub transport_choice: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLogLine {
    pub stream: LogStream,
    pub text: String,
    pub emitted_at: DateTime<Utc>,
}

/// Fields a state transition may set besides the state itself.
/// `assignee`: `Some(Some(id))` sets, `Some(None)` clears, `None` leaves.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub assignee: Option<Option<String>>,
    pub exit_code: Option<i32>,
    pub failure_kind: Option<FailureKind>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub submitter: Option<String>,
    pub assignee: Option<String>,
    pub states: Option<Vec<JobState>>,
    /// Exclusive ULID upper bound for newest-first pagination.
    pub before_id: Option<Ulid>,
    pub limit: Option<usize>,
    /// Terminal jobs are only included if they ended after this instant;
    /// non-terminal jobs always match.
    pub ended_after: Option<DateTime<Utc>>,
}

/// The storage engine registry. Engines are registered here at compile time
/// and selected once from configuration.
#[derive(Clone)]
pub enum Repository {
    Memory(MemoryRepository),
    Sqlite(SqliteRepository),
}

macro_rules! dispatch {
    ($self:ident, $repo:ident => $body:expr) => {
        match $self {
            Repository::Memory($repo) => $body,
            Repository::Sqlite($repo) => $body,
        }
    };
}

impl Repository {
    // --- identities ---------------------------------------------------

    /// Full replacement on existing client_id.
    pub async fn identity_put(&self, identity: Identity) -> RepoResult<()> {
        dispatch!(self, r => r.identity_put(identity).await)
    }

    pub async fn identity_get(&self, client_id: &str) -> RepoResult<Option<Identity>> {
        dispatch!(self, r => r.identity_get(client_id).await)
    }

    pub async fn identity_delete(&self, client_id: &str) -> RepoResult<bool> {
        dispatch!(self, r => r.identity_delete(client_id).await)
    }

    pub async fn identity_list(&self) -> RepoResult<Vec<Identity>> {
        dispatch!(self, r => r.identity_list().await)
    }

    /// Client ids of identities not encrypted under `key_id` (for rotation).
    /// `None` means "find identities that are encrypted at all".
    pub async fn identities_not_using_key(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> RepoResult<Vec<String>> {
        dispatch!(self, r => r.identities_not_using_key(key_id, limit).await)
    }

    // --- workers ------------------------------------------------------

    /// Idempotent: inserts if absent, refreshes last_seen_at and the
    /// advertised sets otherwise. Always leaves the worker online.
    pub async fn worker_register(
        &self,
        reg: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        dispatch!(self, r => r.worker_register(reg, now).await)
    }

    pub async fn worker_get(&self, worker_id: &str) -> RepoResult<Option<Worker>> {
        dispatch!(self, r => r.worker_get(worker_id).await)
    }

    pub async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> RepoResult<()> {
        dispatch!(self, r => r.worker_heartbeat(worker_id, now).await)
    }

    pub async fn worker_mark_offline(&self, worker_id: &str) -> RepoResult<()> {
        dispatch!(self, r => r.worker_mark_offline(worker_id).await)
    }

    pub async fn workers_by_status(&self, status: WorkerStatus) -> RepoResult<Vec<Worker>> {
        dispatch!(self, r => r.workers_by_status(status).await)
    }

    /// Online workers whose last_seen_at is older than
    /// `factor * registration_interval_s`.
    pub async fn workers_stale(&self, now: DateTime<Utc>, factor: f64) -> RepoResult<Vec<Worker>> {
        dispatch!(self, r => r.workers_stale(now, factor).await)
    }

    /// Jobs currently held (assigned/running/canceling) per worker.
    pub async fn worker_load(&self) -> RepoResult<HashMap<String, usize>> {
        dispatch!(self, r => r.worker_load().await)
    }

    // --- jobs ---------------------------------------------------------

    pub async fn jobs_submit(&self, job: Job) -> RepoResult<()> {
        dispatch!(self, r => r.jobs_submit(job).await)
    }

    pub async fn job_get(&self, job_id: Ulid) -> RepoResult<Option<Job>> {
        dispatch!(self, r => r.job_get(job_id).await)
    }

    /// The atomic scheduling primitive: pick the oldest pending job some
    /// candidate can run, transition it pending→assigned, and return the
    /// pair. Also marks `ever_eligible` on every scanned pending job with a
    /// capable candidate. Safe under concurrent callers: the transition is
    /// conditional on `state = pending`.
    pub async fn jobs_assign_one(
        &self,
        candidates: &[WorkerCandidate],
        soft_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Assignment>> {
        dispatch!(self, r => r.jobs_assign_one(candidates, soft_limit, now).await)
    }

    /// Conditional state transition. Returns the updated job, or
    /// `Conflict` if the job is not in any of `from`, or `NotFound`.
    /// Timestamps are derived from `to`: assigned_at on Assigned, started_at
    /// (and an initial heartbeat) on Running, ended_at on terminal states;
    /// state_entered_at always. Terminal states are absorbing: they are
    /// stripped from `from` here, so no caller can transition out of one.
    pub async fn job_transition(
        &self,
        job_id: Ulid,
        from: &[JobState],
        to: JobState,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Job> {
        let from: Vec<JobState> = from
            .iter()
            .copied()
            .filter(|state| !state.is_terminal())
            .collect();
        if from.is_empty() {
            return Err(RepoError::Conflict(job_id));
        }
        dispatch!(self, r => r.job_transition(job_id, &from, to, update, now).await)
    }

    /// Worker-side heartbeat; only valid while assigned/running/canceling.
    pub async fn job_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        dispatch!(self, r => r.job_heartbeat(job_id, now).await)
    }

    /// Client-side heartbeat for active-mode jobs.
    pub async fn job_client_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        dispatch!(self, r => r.job_client_heartbeat(job_id, now).await)
    }

    /// Append a batch of log lines with auto-numbered dense seq. Batches are
    /// serialized per engine, so concurrent appends never interleave seqs.
    /// Returns the (first, last) seq assigned.
    pub async fn job_append_log(
        &self,
        job_id: Ulid,
        lines: Vec<NewLogLine>,
    ) -> RepoResult<(u64, u64)> {
        dispatch!(self, r => r.job_append_log(job_id, lines).await)
    }

    pub async fn job_logs(
        &self,
        job_id: Ulid,
        since_seq: Option<u64>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<LogChunk>> {
        dispatch!(self, r => r.job_logs(job_id, since_seq, limit).await)
    }

    /// Read-only pagination, newest first.
    pub async fn jobs_query(&self, filter: &JobFilter) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_query(filter).await)
    }

    pub async fn jobs_for_worker_in(
        &self,
        worker_id: &str,
        states: &[JobState],
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_for_worker_in(worker_id, states).await)
    }

    // --- janitor scans ------------------------------------------------

    pub async fn jobs_stale_assigned(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_stale_assigned(now, timeout_s).await)
    }

    pub async fn jobs_stale_heartbeat(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_stale_heartbeat(now, factor).await)
    }

    /// Pending jobs past the timeout for which no eligible worker has ever
    /// been observed.
    pub async fn jobs_stale_pending(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_stale_pending(now, timeout_s).await)
    }

    pub async fn jobs_stale_canceling(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_stale_canceling(now, timeout_s).await)
    }

    /// Active-mode, non-terminal jobs whose client stopped heartbeating for
    /// more than `factor * heartbeat_interval_s`.
    pub async fn jobs_stale_client(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        dispatch!(self, r => r.jobs_stale_client(now, factor).await)
    }

    /// Drop logs of terminal jobs past the retention window. Returns the
    /// number of removed chunks.
    pub async fn logs_prune(&self, now: DateTime<Utc>, retention_s: u64) -> RepoResult<usize> {
        dispatch!(self, r => r.logs_prune(now, retention_s).await)
    }

    /// Drop undelivered downlink messages past their TTL.
    pub async fn downlink_prune(&self, now: DateTime<Utc>, ttl_s: u64) -> RepoResult<usize> {
        dispatch!(self, r => r.downlink_prune(now, ttl_s).await)
    }

    // --- downlink -----------------------------------------------------

    pub async fn downlink_enqueue(&self, msg: DownlinkMessage) -> RepoResult<()> {
        dispatch!(self, r => r.downlink_enqueue(msg).await)
    }

    /// Remove and return up to `max` queued messages for a recipient,
    /// oldest first. Messages are gone from the queue once returned.
    pub async fn downlink_drain(
        &self,
        recipient: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<DownlinkMessage>> {
        dispatch!(self, r => r.downlink_drain(recipient, max, now).await)
    }
}

/// Retry transient storage failures with jittered exponential backoff.
/// Only `Storage` errors retry; everything else (including `Conflict`)
/// surfaces immediately.
pub async fn with_storage_retries<T, F, Fut>(attempts: u32, mut op: F) -> RepoResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RepoResult<T>>,
{
    use rand::Rng;

    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(RepoError::Storage(detail)) if attempt + 1 < attempts.max(1) => {
                attempt += 1;
                let base = 50u64 * 2u64.pow(attempt.min(6));
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                tracing::debug!(attempt, error = %detail, "retrying transient storage failure");
                tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
            }
            result => return result,
        }
    }
}

/// Pick the first candidate that can take the job right now, honoring the
/// per-worker soft limit. Shared by both engines so their eligibility
/// semantics cannot drift.
pub(crate) fn pick_candidate<'a>(
    candidates: &'a [WorkerCandidate],
    binary: &str,
    required: &BTreeSet<String>,
    soft_limit: Option<u32>,
) -> (bool, Option<&'a WorkerCandidate>) {
    let mut any_capable = false;
    let mut chosen = None;
    for candidate in candidates {
        if !candidate.can_run(binary, required) {
            continue;
        }
        any_capable = true;
        let under_limit = soft_limit.is_none_or(|limit| candidate.running < limit as usize);
        if under_limit {
            chosen = Some(candidate);
            break;
        }
    }
    (any_capable, chosen)
}
