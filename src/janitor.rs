//! The janitor: a periodic background task enforcing liveness.
//!
//! Sweeps run in a fixed order; every transition is conditional on the
//! source state, so re-running a sweep (or racing another replica) is
//! harmless, and a failure on one row never aborts the rest of the sweep.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::JanitorConfig;
use crate::model::{
    DownlinkKind, DownlinkMessage, FailureKind, Job, JobState, Worker,
};
use crate::repo::{RepoError, Repository, TransitionUpdate};
use crate::transport::{job_state_payload, TransportRegistry};

/// How many client heartbeat intervals may elapse before an active-mode job
/// is considered abandoned.
const CLIENT_LOST_FACTOR: f64 = 2.0;

pub struct Janitor {
    repo: Repository,
    transports: Arc<TransportRegistry>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(repo: Repository, transports: Arc<TransportRegistry>, config: JanitorConfig) -> Self {
        Self {
            repo,
            transports,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval_s = self.config.interval_s, "janitor started");
        loop {
            let sleep = self.jittered_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
            self.sweep_all(Utc::now()).await;
        }
        tracing::info!("janitor stopped");
    }

    /// Replicas sharing a database should not sweep in lockstep.
    fn jittered_interval(&self) -> std::time::Duration {
        let base = self.config.interval_s.max(1) as f64;
        let spread = self.config.jitter * base;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..spread)
        } else {
            0.0
        };
        std::time::Duration::from_secs_f64((base + offset).max(0.5))
    }

    /// Run every sweep once, in order. Errors are logged per sweep.
    pub async fn sweep_all(&self, now: DateTime<Utc>) {
        if let Err(e) = self.sweep_stale_workers(now).await {
            tracing::warn!(error = %e, "stale worker sweep failed");
        }
        if let Err(e) = self.sweep_stale_assignments(now).await {
            tracing::warn!(error = %e, "stale assignment sweep failed");
        }
        if let Err(e) = self.sweep_stale_heartbeats(now).await {
            tracing::warn!(error = %e, "stale heartbeat sweep failed");
        }
        if let Err(e) = self.sweep_stale_pending(now).await {
            tracing::warn!(error = %e, "stale pending sweep failed");
        }
        if let Err(e) = self.sweep_stuck_canceling(now).await {
            tracing::warn!(error = %e, "stuck canceling sweep failed");
        }
        if let Err(e) = self.sweep_lost_clients(now).await {
            tracing::warn!(error = %e, "lost client sweep failed");
        }
        if let Err(e) = self.sweep_retention(now).await {
            tracing::warn!(error = %e, "retention sweep failed");
        }
    }

    /// Workers that stopped re-registering go offline. Their running
    /// jobs fail (worker_lost); their assigned jobs return to the queue.
    async fn sweep_stale_workers(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        for worker in self
            .repo
            .workers_stale(now, self.config.worker_threshold_factor)
            .await?
        {
            tracing::warn!(worker_id = %worker.worker_id, "worker went stale, marking offline");
            self.repo.worker_mark_offline(&worker.worker_id).await?;
            self.fail_lost_worker_jobs(&worker, now).await?;
        }
        Ok(())
    }

    async fn fail_lost_worker_jobs(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        for job in self
            .repo
            .jobs_for_worker_in(&worker.worker_id, &[JobState::Running])
            .await?
        {
            let update = TransitionUpdate {
                failure_kind: Some(FailureKind::WorkerLost),
                ..TransitionUpdate::default()
            };
            match self
                .repo
                .job_transition(job.job_id, &[JobState::Running], JobState::Failed, update, now)
                .await
            {
                Ok(updated) => {
                    tracing::warn!(job_id = %job.job_id, worker_id = %worker.worker_id,
                        "job failed: worker lost");
                    self.notify_client(&updated).await;
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }

        for job in self
            .repo
            .jobs_for_worker_in(&worker.worker_id, &[JobState::Assigned])
            .await?
        {
            let update = TransitionUpdate {
                assignee: Some(None),
                ..TransitionUpdate::default()
            };
            match self
                .repo
                .job_transition(job.job_id, &[JobState::Assigned], JobState::Pending, update, now)
                .await
            {
                Ok(_) => {
                    tracing::info!(job_id = %job.job_id, worker_id = %worker.worker_id,
                        "assigned job returned to queue: worker lost");
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }
        Ok(())
    }

    /// Assignments never accepted revert to pending for reassignment.
    /// The retry count is observable in the logs only.
    async fn sweep_stale_assignments(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut reverted = 0usize;
        for job in self
            .repo
            .jobs_stale_assigned(now, self.config.job_assignment_timeout_s)
            .await?
        {
            let worker_id = job.assignee_id.clone();
            let update = TransitionUpdate {
                assignee: Some(None),
                ..TransitionUpdate::default()
            };
            match self
                .repo
                .job_transition(job.job_id, &[JobState::Assigned], JobState::Pending, update, now)
                .await
            {
                Ok(_) => {
                    reverted += 1;
                    tracing::warn!(job_id = %job.job_id, worker_id = ?worker_id,
                        "assignment timed out, job re-queued");
                    // Tell the worker the assignment is gone in case it
                    // eventually saw it.
                    if let Some(worker_id) = worker_id {
                        let choice = self.worker_choice(&worker_id).await;
                        self.transports
                            .deliver(
                                choice.as_deref(),
                                DownlinkMessage::to_worker(
                                    worker_id,
                                    DownlinkKind::JobCanceled,
                                    Some(job.job_id),
                                    serde_json::json!({
                                        "job_id": job.job_id.to_string(),
                                        "state": "pending",
                                    }),
                                    now,
                                ),
                            )
                            .await;
                    }
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }
        if reverted > 0 {
            tracing::warn!(reverted, "assignment timeout sweep reverted jobs");
        }
        Ok(())
    }

    /// Running/canceling jobs with a stale worker heartbeat fail.
    async fn sweep_stale_heartbeats(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        for job in self
            .repo
            .jobs_stale_heartbeat(now, self.config.job_heartbeat_threshold_factor)
            .await?
        {
            let update = TransitionUpdate {
                failure_kind: Some(FailureKind::HeartbeatLost),
                ..TransitionUpdate::default()
            };
            match self
                .repo
                .job_transition(
                    job.job_id,
                    &[JobState::Running, JobState::Canceling],
                    JobState::Failed,
                    update,
                    now,
                )
                .await
            {
                Ok(updated) => {
                    tracing::warn!(job_id = %job.job_id, "job failed: heartbeat lost");
                    self.notify_client(&updated).await;
                    self.notify_worker_state(&updated, now).await;
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }
        Ok(())
    }

    /// Pending jobs no worker could ever run give up.
    async fn sweep_stale_pending(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        for job in self
            .repo
            .jobs_stale_pending(now, self.config.job_pending_timeout_s)
            .await?
        {
            let update = TransitionUpdate {
                failure_kind: Some(FailureKind::NoEligibleWorker),
                ..TransitionUpdate::default()
            };
            match self
                .repo
                .job_transition(job.job_id, &[JobState::Pending], JobState::Failed, update, now)
                .await
            {
                Ok(updated) => {
                    tracing::warn!(job_id = %job.job_id, "job failed: no eligible worker");
                    self.notify_client(&updated).await;
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }
        Ok(())
    }

    /// Canceling jobs whose worker never confirmed are force-canceled.
    /// This also resolves the case where the assignee went offline while the
    /// job was canceling.
    async fn sweep_stuck_canceling(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        for job in self
            .repo
            .jobs_stale_canceling(now, self.config.job_assignment_timeout_s)
            .await?
        {
            match self
                .repo
                .job_transition(
                    job.job_id,
                    &[JobState::Canceling],
                    JobState::Canceled,
                    TransitionUpdate::default(),
                    now,
                )
                .await
            {
                Ok(updated) => {
                    tracing::warn!(job_id = %job.job_id, "cancellation timed out, forcing canceled");
                    self.notify_client(&updated).await;
                }
                Err(RepoError::Conflict(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "transition failed"),
            }
        }
        Ok(())
    }

    /// Active-mode jobs whose client stopped heartbeating get canceled.
    async fn sweep_lost_clients(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        for job in self.repo.jobs_stale_client(now, CLIENT_LOST_FACTOR).await? {
            match job.state {
                JobState::Pending => {
                    let update = TransitionUpdate {
                        failure_kind: Some(FailureKind::ClientDisconnected),
                        ..TransitionUpdate::default()
                    };
                    match self
                        .repo
                        .job_transition(
                            job.job_id,
                            &[JobState::Pending],
                            JobState::Canceled,
                            update,
                            now,
                        )
                        .await
                    {
                        Ok(_) => {
                            tracing::warn!(job_id = %job.job_id, "job canceled: client disconnected");
                        }
                        Err(RepoError::Conflict(_)) => {}
                        Err(e) => {
                            tracing::warn!(job_id = %job.job_id, error = %e, "transition failed");
                        }
                    }
                }
                JobState::Assigned | JobState::Running => {
                    let update = TransitionUpdate {
                        failure_kind: Some(FailureKind::ClientDisconnected),
                        ..TransitionUpdate::default()
                    };
                    match self
                        .repo
                        .job_transition(
                            job.job_id,
                            &[JobState::Assigned, JobState::Running],
                            JobState::Canceling,
                            update,
                            now,
                        )
                        .await
                    {
                        Ok(updated) => {
                            tracing::warn!(job_id = %job.job_id,
                                "canceling job: client disconnected");
                            self.notify_worker_cancel(&updated, now).await;
                        }
                        Err(RepoError::Conflict(_)) => {}
                        Err(e) => {
                            tracing::warn!(job_id = %job.job_id, error = %e, "transition failed");
                        }
                    }
                }
                // The stuck-canceling sweep owns jobs already canceling; terminal states are done.
                _ => {}
            }
        }
        Ok(())
    }

    /// Retention: logs of long-terminal jobs and expired downlink
    /// messages are dropped.
    async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<(), RepoError> {
        let chunks = self.repo.logs_prune(now, self.config.log_retention_s).await?;
        if chunks > 0 {
            tracing::debug!(chunks, "pruned expired job logs");
        }
        let messages = self
            .repo
            .downlink_prune(now, self.config.downlink_ttl_s)
            .await?;
        if messages > 0 {
            tracing::debug!(messages, "pruned expired downlink messages");
        }
        Ok(())
    }

    async fn worker_choice(&self, worker_id: &str) -> Option<String> {
        match self.repo.worker_get(worker_id).await {
            Ok(Some(worker)) => worker.transport_choice,
            _ => None,
        }
    }

    async fn notify_client(&self, job: &Job) {
        self.transports
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

    async fn notify_worker_state(&self, job: &Job, now: DateTime<Utc>) {
        let Some(worker_id) = job.assignee_id.clone() else {
            return;
        };
        let choice = self.worker_choice(&worker_id).await;
        self.transports
            .deliver(
                choice.as_deref(),
                DownlinkMessage::to_worker(
                    worker_id,
                    DownlinkKind::JobStateChanged,
                    Some(job.job_id),
                    job_state_payload(job),
                    now,
                ),
            )
            .await;
    }

    async fn notify_worker_cancel(&self, job: &Job, now: DateTime<Utc>) {
        let Some(worker_id) = job.assignee_id.clone() else {
            return;
        };
        let choice = self.worker_choice(&worker_id).await;
        self.transports
            .deliver(
                choice.as_deref(),
                DownlinkMessage::to_worker(
                    worker_id,
                    DownlinkKind::JobCanceled,
                    Some(job.job_id),
                    job_state_payload(job),
                    now,
                ),
            )
            .await;
    }
}
