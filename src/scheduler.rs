//! The scheduler: matches pending jobs to eligible online workers.
//!
//! Runs on a timer plus coalesced wake-ups (job submitted, worker online or
//! finished). A pass keeps calling the repository's atomic assignment
//! primitive until no viable (job, worker) pair remains. Passes are
//! idempotent and safe under concurrency because the pending→assigned
//! transition is conditional; a replica losing the race just moves on.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::model::{DownlinkKind, DownlinkMessage, WorkerStatus};
use crate::repo::{Assignment, RepoResult, Repository, WorkerCandidate};
use crate::transport::{DownlinkWaiters, TransportRegistry};

/// Cheap cloneable handle used by API handlers to nudge the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

pub struct Scheduler {
    repo: Repository,
    transports: Arc<TransportRegistry>,
    waiters: Arc<DownlinkWaiters>,
    config: SchedulerConfig,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        repo: Repository,
        transports: Arc<TransportRegistry>,
        waiters: Arc<DownlinkWaiters>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            transports,
            waiters,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            wake: self.wake.clone(),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.tick_interval_s.max(1),
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_s = self.config.tick_interval_s,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
            }
            match self.pass().await {
                Ok(0) => {}
                Ok(assigned) => tracing::debug!(assigned, "scheduler pass assigned jobs"),
                // Transient storage trouble resolves itself on the next
                // tick; nothing is lost because assignment is conditional.
                Err(e) => tracing::warn!(error = %e, "scheduler pass failed"),
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One scheduling pass: drain viable (job, worker) pairs until none
    /// remain. Returns how many jobs were assigned.
    pub async fn pass(&self) -> RepoResult<usize> {
        let mut assigned = 0;
        loop {
            let workers = self.repo.workers_by_status(WorkerStatus::Online).await?;
            if workers.is_empty() {
                break;
            }
            let load = self.repo.worker_load().await?;

            let mut candidates: Vec<WorkerCandidate> = workers
                .into_iter()
                .map(|worker| WorkerCandidate {
                    running: load.get(&worker.worker_id).copied().unwrap_or(0),
                    worker_id: worker.worker_id,
                    binaries: worker.advertised_binaries,
                    variables: worker.advertised_variables,
                })
                .collect();
            // Tie-break: fewest running jobs, then lexicographic worker id.
            candidates.sort_by(|a, b| {
                a.running
                    .cmp(&b.running)
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            });

            let Some(assignment) = self
                .repo
                .jobs_assign_one(&candidates, self.config.per_worker_soft_limit, Utc::now())
                .await?
            else {
                break;
            };

            tracing::info!(
                job_id = %assignment.job_id,
                worker_id = %assignment.worker_id,
                "job assigned"
            );
            assigned += 1;
            self.notify_assignment(&assignment).await;
        }
        Ok(assigned)
    }

    /// Downlink notifications for a fresh assignment. Best-effort: the
    /// assignment itself is already durable.
    async fn notify_assignment(&self, assignment: &Assignment) {
        let job = match self.repo.job_get(assignment.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(job_id = %assignment.job_id, error = %e,
                    "could not load job for assignment notification");
                return;
            }
        };

        let worker_choice = match self.repo.worker_get(&assignment.worker_id).await {
            Ok(Some(worker)) => worker.transport_choice,
            _ => None,
        };

        let now = Utc::now();
        let worker_payload = serde_json::json!({
            "job_id": job.job_id.to_string(),
            "state": job.state.as_str(),
            "binary": job.binary,
            "argv": job.argv,
            "heartbeat_interval_s": job.heartbeat_interval_s,
        });
        self.transports
            .deliver(
                worker_choice.as_deref(),
                DownlinkMessage::to_worker(
                    &assignment.worker_id,
                    DownlinkKind::JobAssigned,
                    Some(job.job_id),
                    worker_payload,
                    now,
                ),
            )
            .await;
        // Wake a worker blocked on its work long-poll even when its
        // negotiated transport is a broker.
        self.waiters.notify(&assignment.worker_id);

        self.transports
            .deliver(
                job.transport_choice.as_deref(),
                DownlinkMessage::to_client(
                    &job.submitter_id,
                    DownlinkKind::JobStateChanged,
                    Some(job.job_id),
                    crate::transport::job_state_payload(&job),
                    now,
                ),
            )
            .await;
    }
}
