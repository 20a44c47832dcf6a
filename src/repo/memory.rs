//! In-memory storage engine.
//!
//! Backs tests and single-process dev deployments. Every operation takes the
//! state lock for its whole duration, which makes each op atomic and gives
//! the same caller-visible behavior as the sqlite engine's conditional
//! updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::{
    DownlinkMessage, Identity, Job, JobMode, JobState, LogChunk, Worker, WorkerStatus,
};
use crate::repo::{
    pick_candidate, Assignment, JobFilter, NewLogLine, RepoError, RepoResult, TransitionUpdate,
    WorkerCandidate, WorkerRegistration,
};

#[derive(Default)]
struct MemoryState {
    identities: HashMap<String, Identity>,
    workers: HashMap<String, Worker>,
    jobs: HashMap<Ulid, Job>,
    logs: HashMap<Ulid, Vec<LogChunk>>,
    downlinks: BTreeMap<Ulid, DownlinkMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // --- identities ---------------------------------------------------

    pub async fn identity_put(&self, identity: Identity) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.identities.insert(identity.client_id.clone(), identity);
        Ok(())
    }

    pub async fn identity_get(&self, client_id: &str) -> RepoResult<Option<Identity>> {
        let state = self.state.read().await;
        Ok(state.identities.get(client_id).cloned())
    }

    pub async fn identity_delete(&self, client_id: &str) -> RepoResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.identities.remove(client_id).is_some())
    }

    pub async fn identity_list(&self) -> RepoResult<Vec<Identity>> {
        let state = self.state.read().await;
        let mut identities: Vec<Identity> = state.identities.values().cloned().collect();
        identities.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(identities)
    }

    pub async fn identities_not_using_key(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> RepoResult<Vec<String>> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .identities
            .values()
            .filter(|identity| match key_id {
                // Decrypt mode: target everything currently encrypted.
                None => identity.key_id.as_deref().is_some_and(|k| !k.is_empty()),
                Some(target) => identity.key_id.as_deref() != Some(target),
            })
            .map(|identity| identity.client_id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    // --- workers ------------------------------------------------------

    pub async fn worker_register(
        &self,
        reg: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        match state.workers.get_mut(&reg.worker_id) {
            Some(worker) => {
                worker.status = WorkerStatus::Online;
                worker.last_seen_at = now;
                worker.registration_interval_s = reg.registration_interval_s;
                worker.version = reg.version;
                worker.advertised_binaries = reg.advertised_binaries;
                worker.advertised_variables = reg.advertised_variables;
                worker.transport_choice = reg.transport_choice;
            }
            None => {
                state.workers.insert(
                    reg.worker_id.clone(),
                    Worker {
                        worker_id: reg.worker_id,
                        status: WorkerStatus::Online,
                        registered_at: now,
                        last_seen_at: now,
                        registration_interval_s: reg.registration_interval_s,
                        version: reg.version,
                        advertised_binaries: reg.advertised_binaries,
                        advertised_variables: reg.advertised_variables,
                        transport_choice: reg.transport_choice,
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn worker_get(&self, worker_id: &str) -> RepoResult<Option<Worker>> {
        let state = self.state.read().await;
        Ok(state.workers.get(worker_id).cloned())
    }

    pub async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| RepoError::UnknownWorker(worker_id.to_string()))?;
        if now > worker.last_seen_at {
            worker.last_seen_at = now;
        }
        Ok(())
    }

    pub async fn worker_mark_offline(&self, worker_id: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Offline;
        }
        Ok(())
    }

    pub async fn workers_by_status(&self, status: WorkerStatus) -> RepoResult<Vec<Worker>> {
        let state = self.state.read().await;
        let mut workers: Vec<Worker> = state
            .workers
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    pub async fn workers_stale(&self, now: DateTime<Utc>, factor: f64) -> RepoResult<Vec<Worker>> {
        let state = self.state.read().await;
        Ok(state
            .workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Online
                    && is_stale(
                        w.last_seen_at,
                        now,
                        f64::from(w.registration_interval_s) * factor,
                    )
            })
            .cloned()
            .collect())
    }

    pub async fn worker_load(&self) -> RepoResult<HashMap<String, usize>> {
        let state = self.state.read().await;
        let mut load = HashMap::new();
        for job in state.jobs.values() {
            if matches!(
                job.state,
                JobState::Assigned | JobState::Running | JobState::Canceling
            ) {
                if let Some(assignee) = &job.assignee_id {
                    *load.entry(assignee.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(load)
    }

    // --- jobs ---------------------------------------------------------

    pub async fn jobs_submit(&self, job: Job) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.jobs.insert(job.job_id, job);
        Ok(())
    }

    pub async fn job_get(&self, job_id: Ulid) -> RepoResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    pub async fn jobs_assign_one(
        &self,
        candidates: &[WorkerCandidate],
        soft_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Assignment>> {
        let mut state = self.state.write().await;

        // Oldest pending first; ULIDs sort by creation time.
        let mut pending: Vec<Ulid> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| j.job_id)
            .collect();
        pending.sort();

        for job_id in pending {
            let (binary, required) = {
                let job = &state.jobs[&job_id];
                (job.binary.clone(), job.required_variables.clone())
            };
            let (any_capable, chosen) = pick_candidate(candidates, &binary, &required, soft_limit);
            let chosen = chosen.map(|c| c.worker_id.clone());

            let job = state.jobs.get_mut(&job_id).ok_or_else(|| {
                RepoError::NotFound(format!("job {job_id}"))
            })?;
            if any_capable {
                job.ever_eligible = true;
            }
            if let Some(worker_id) = chosen {
                job.state = JobState::Assigned;
                job.assignee_id = Some(worker_id.clone());
                job.assigned_at = Some(now);
                job.state_entered_at = now;
                return Ok(Some(Assignment { job_id, worker_id }));
            }
        }
        Ok(None)
    }

    pub async fn job_transition(
        &self,
        job_id: Ulid,
        from: &[JobState],
        to: JobState,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound(format!("job {job_id}")))?;
        if !from.contains(&job.state) {
            return Err(RepoError::Conflict(job_id));
        }

        job.state = to;
        job.state_entered_at = now;
        match to {
            JobState::Assigned => job.assigned_at = Some(now),
            JobState::Running => {
                job.started_at = Some(now);
                job.last_heartbeat_at = Some(now);
            }
            JobState::Completed | JobState::Failed | JobState::Canceled => {
                job.ended_at = Some(now);
            }
            JobState::Pending | JobState::Canceling => {}
        }
        if let Some(assignee) = update.assignee {
            job.assignee_id = assignee;
        }
        if let Some(exit_code) = update.exit_code {
            job.exit_code = Some(exit_code);
        }
        if let Some(kind) = update.failure_kind {
            job.failure_kind = Some(kind);
        }
        Ok(job.clone())
    }

    pub async fn job_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound(format!("job {job_id}")))?;
        if !matches!(
            job.state,
            JobState::Assigned | JobState::Running | JobState::Canceling
        ) {
            return Err(RepoError::Conflict(job_id));
        }
        // last_heartbeat_at is monotonically nondecreasing.
        if job.last_heartbeat_at.is_none_or(|prev| now > prev) {
            job.last_heartbeat_at = Some(now);
        }
        Ok(())
    }

    pub async fn job_client_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound(format!("job {job_id}")))?;
        if job.client_last_seen_at.is_none_or(|prev| now > prev) {
            job.client_last_seen_at = Some(now);
        }
        Ok(())
    }

    pub async fn job_append_log(
        &self,
        job_id: Ulid,
        lines: Vec<NewLogLine>,
    ) -> RepoResult<(u64, u64)> {
        if lines.is_empty() {
            return Err(RepoError::Serialization("empty log batch".to_string()));
        }
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(RepoError::NotFound(format!("job {job_id}")));
        }
        let chunks = state.logs.entry(job_id).or_default();
        let first = chunks.len() as u64;
        // emitted_at is kept nondecreasing across the whole job so readers
        // can rely on (seq, emitted_at) agreeing on order.
        let mut floor = chunks.last().map(|chunk| chunk.emitted_at);
        for (i, line) in lines.into_iter().enumerate() {
            let emitted_at = match floor {
                Some(floor) if line.emitted_at < floor => floor,
                _ => line.emitted_at,
            };
            floor = Some(emitted_at);
            chunks.push(LogChunk {
                job_id,
                seq: first + i as u64,
                stream: line.stream,
                text: line.text,
                emitted_at,
            });
        }
        let last = chunks.len() as u64 - 1;
        Ok((first, last))
    }

    pub async fn job_logs(
        &self,
        job_id: Ulid,
        since_seq: Option<u64>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<LogChunk>> {
        let state = self.state.read().await;
        let chunks = state.logs.get(&job_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = since_seq.map(|s| s as usize + 1).unwrap_or(0);
        let mut out: Vec<LogChunk> = chunks.iter().skip(start).cloned().collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub async fn jobs_query(&self, filter: &JobFilter) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                if let Some(submitter) = &filter.submitter {
                    if &job.submitter_id != submitter {
                        return false;
                    }
                }
                if let Some(assignee) = &filter.assignee {
                    if job.assignee_id.as_deref() != Some(assignee.as_str()) {
                        return false;
                    }
                }
                if let Some(states) = &filter.states {
                    if !states.contains(&job.state) {
                        return false;
                    }
                }
                if let Some(before) = filter.before_id {
                    if job.job_id >= before {
                        return false;
                    }
                }
                if let Some(cutoff) = filter.ended_after {
                    if job.state.is_terminal() && job.ended_at.is_none_or(|t| t <= cutoff) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.job_id.cmp(&a.job_id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    pub async fn jobs_for_worker_in(
        &self,
        worker_id: &str,
        states: &[JobState],
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.assignee_id.as_deref() == Some(worker_id) && states.contains(&j.state)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        Ok(jobs)
    }

    // --- janitor scans ------------------------------------------------

    pub async fn jobs_stale_assigned(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Assigned
                    && j.assigned_at
                        .is_some_and(|t| is_stale(t, now, timeout_s as f64))
            })
            .cloned()
            .collect())
    }

    pub async fn jobs_stale_heartbeat(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                matches!(j.state, JobState::Running | JobState::Canceling)
                    && j.last_heartbeat_at.is_some_and(|t| {
                        is_stale(t, now, f64::from(j.heartbeat_interval_s) * factor)
                    })
            })
            .cloned()
            .collect())
    }

    pub async fn jobs_stale_pending(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Pending
                    && !j.ever_eligible
                    && is_stale(j.created_at, now, timeout_s as f64)
            })
            .cloned()
            .collect())
    }

    pub async fn jobs_stale_canceling(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Canceling
                    && is_stale(j.state_entered_at, now, timeout_s as f64)
            })
            .cloned()
            .collect())
    }

    pub async fn jobs_stale_client(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.mode == JobMode::Active
                    && !j.state.is_terminal()
                    && j.client_last_seen_at.is_some_and(|t| {
                        is_stale(t, now, f64::from(j.heartbeat_interval_s) * factor)
                    })
            })
            .cloned()
            .collect())
    }

    pub async fn logs_prune(&self, now: DateTime<Utc>, retention_s: u64) -> RepoResult<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<Ulid> = state
            .logs
            .keys()
            .filter(|job_id| match state.jobs.get(*job_id) {
                Some(job) => {
                    job.state.is_terminal()
                        && job
                            .ended_at
                            .is_some_and(|t| is_stale(t, now, retention_s as f64))
                }
                // Job row gone entirely; nothing left to retain for.
                None => true,
            })
            .copied()
            .collect();
        let mut removed = 0;
        for job_id in expired {
            if let Some(chunks) = state.logs.remove(&job_id) {
                removed += chunks.len();
            }
        }
        Ok(removed)
    }

    pub async fn downlink_prune(&self, now: DateTime<Utc>, ttl_s: u64) -> RepoResult<usize> {
        let mut state = self.state.write().await;
        let before = state.downlinks.len();
        state
            .downlinks
            .retain(|_, msg| !is_stale(msg.created_at, now, ttl_s as f64));
        Ok(before - state.downlinks.len())
    }

    // --- downlink -----------------------------------------------------

    pub async fn downlink_enqueue(&self, msg: DownlinkMessage) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.downlinks.insert(msg.message_id, msg);
        Ok(())
    }

    pub async fn downlink_drain(
        &self,
        recipient: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<DownlinkMessage>> {
        let mut state = self.state.write().await;
        let ids: Vec<Ulid> = state
            .downlinks
            .values()
            .filter(|m| m.recipient_id == recipient)
            .take(max)
            .map(|m| m.message_id)
            .collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut msg) = state.downlinks.remove(&id) {
                msg.delivered_at = Some(now);
                drained.push(msg);
            }
        }
        Ok(drained)
    }
}

fn is_stale(then: DateTime<Utc>, now: DateTime<Utc>, threshold_s: f64) -> bool {
    let threshold = Duration::milliseconds((threshold_s * 1000.0) as i64);
    now.signed_duration_since(then) > threshold
}
