//! Scheduler tests: eligibility filtering, tie-breaking, wake-up-driven
//! assignment, and the downlink notifications a fresh assignment produces.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use ulid::Ulid;

use dffmpeg_coordinator::config::{SchedulerConfig, TransportsConfig};
use dffmpeg_coordinator::model::{Job, JobMode, JobState};
use dffmpeg_coordinator::pathvar::ArgvToken;
use dffmpeg_coordinator::repo::{MemoryRepository, Repository, WorkerRegistration};
use dffmpeg_coordinator::scheduler::Scheduler;
use dffmpeg_coordinator::transport::{DownlinkWaiters, TransportRegistry};

struct Setup {
    repo: Repository,
    scheduler: Scheduler,
}

fn setup() -> Setup {
    setup_with(SchedulerConfig::default())
}

fn setup_with(config: SchedulerConfig) -> Setup {
    let repo = Repository::Memory(MemoryRepository::new());
    let waiters = Arc::new(DownlinkWaiters::new());
    let transports = Arc::new(TransportRegistry::from_config(
        &TransportsConfig::default(),
        repo.clone(),
        waiters.clone(),
    ));
    let scheduler = Scheduler::new(repo.clone(), transports, waiters, config);
    Setup { repo, scheduler }
}

async fn register(repo: &Repository, worker_id: &str, binaries: &[&str], variables: &[&str]) {
    repo.worker_register(
        WorkerRegistration {
            worker_id: worker_id.to_string(),
            registration_interval_s: 15,
            version: "1.0.0".to_string(),
            advertised_binaries: binaries.iter().map(|s| s.to_string()).collect(),
            advertised_variables: variables.iter().map(|s| s.to_string()).collect(),
            transport_choice: Some("http_polling".to_string()),
        },
        Utc::now(),
    )
    .await
    .unwrap();
}

async fn submit(repo: &Repository, binary: &str, variables: &[&str]) -> Ulid {
    let mut argv = vec![ArgvToken::Literal {
        value: "-i".to_string(),
    }];
    for variable in variables {
        argv.push(ArgvToken::Var {
            variable: variable.to_string(),
            subpath: "in.mkv".to_string(),
        });
    }
    argv.push(ArgvToken::Literal {
        value: "out.mp4".to_string(),
    });

    let job = Job::new(
        Ulid::new(),
        "alice".to_string(),
        binary.to_string(),
        argv,
        variables.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        JobMode::Detached,
        Some("http_polling".to_string()),
        15,
        Utc::now(),
    );
    let id = job.job_id;
    repo.jobs_submit(job).await.unwrap();
    id
}

#[tokio::test]
async fn assigns_to_matching_worker() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "w1", &["ffmpeg"], &["M", "TV"]).await;
    let job_id = submit(&repo, "ffmpeg", &["M"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 1);

    let job = repo.job_get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Assigned);
    assert_eq!(job.assignee_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn no_workers_means_no_assignment() {
    let Setup { repo, scheduler } = setup();
    let job_id = submit(&repo, "ffmpeg", &["M"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 0);
    let job = repo.job_get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(!job.ever_eligible);
}

#[tokio::test]
async fn skips_workers_missing_binary_or_variables() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "probe-only", &["ffprobe"], &["M"]).await;
    register(&repo, "no-mount", &["ffmpeg"], &["TV"]).await;
    let job_id = submit(&repo, "ffmpeg", &["M"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 0);
    let job = repo.job_get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    // No capable worker has ever existed for this job.
    assert!(!job.ever_eligible);
}

#[tokio::test]
async fn requires_every_variable() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "partial", &["ffmpeg"], &["M"]).await;
    register(&repo, "full", &["ffmpeg"], &["M", "TV"]).await;
    let job_id = submit(&repo, "ffmpeg", &["M", "TV"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 1);
    let job = repo.job_get(job_id).await.unwrap().unwrap();
    assert_eq!(job.assignee_id.as_deref(), Some("full"));
}

#[tokio::test]
async fn prefers_least_loaded_then_lexicographic() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "w-b", &["ffmpeg"], &["M"]).await;
    register(&repo, "w-a", &["ffmpeg"], &["M"]).await;

    // Equal load: lexicographic order wins.
    let first = submit(&repo, "ffmpeg", &["M"]).await;
    assert_eq!(scheduler.pass().await.unwrap(), 1);
    let job = repo.job_get(first).await.unwrap().unwrap();
    assert_eq!(job.assignee_id.as_deref(), Some("w-a"));

    // w-a now holds a job, so the next one goes to w-b.
    let second = submit(&repo, "ffmpeg", &["M"]).await;
    assert_eq!(scheduler.pass().await.unwrap(), 1);
    let job = repo.job_get(second).await.unwrap().unwrap();
    assert_eq!(job.assignee_id.as_deref(), Some("w-b"));
}

#[tokio::test]
async fn one_pass_drains_every_viable_pair() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "w1", &["ffmpeg"], &["M"]).await;
    register(&repo, "w2", &["ffmpeg"], &["M"]).await;
    for _ in 0..4 {
        submit(&repo, "ffmpeg", &["M"]).await;
    }

    assert_eq!(scheduler.pass().await.unwrap(), 4);
    // Load spread evenly across the two workers.
    let load = repo.worker_load().await.unwrap();
    assert_eq!(load.get("w1"), Some(&2));
    assert_eq!(load.get("w2"), Some(&2));

    // Idempotent: a second pass finds nothing.
    assert_eq!(scheduler.pass().await.unwrap(), 0);
}

#[tokio::test]
async fn soft_limit_caps_concurrent_jobs_per_worker() {
    let Setup { repo, scheduler } = setup_with(SchedulerConfig {
        tick_interval_s: 1,
        per_worker_soft_limit: Some(1),
    });
    register(&repo, "w1", &["ffmpeg"], &["M"]).await;
    let first = submit(&repo, "ffmpeg", &["M"]).await;
    let second = submit(&repo, "ffmpeg", &["M"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 1);
    assert_eq!(
        repo.job_get(first).await.unwrap().unwrap().state,
        JobState::Assigned
    );
    let waiting = repo.job_get(second).await.unwrap().unwrap();
    assert_eq!(waiting.state, JobState::Pending);
    // A capable worker exists, it is just busy.
    assert!(waiting.ever_eligible);
}

#[tokio::test]
async fn assignment_enqueues_worker_and_client_notifications() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "w1", &["ffmpeg"], &["M"]).await;
    let job_id = submit(&repo, "ffmpeg", &["M"]).await;
    assert_eq!(scheduler.pass().await.unwrap(), 1);

    let worker_msgs = repo.downlink_drain("w1", 10, Utc::now()).await.unwrap();
    assert_eq!(worker_msgs.len(), 1);
    assert_eq!(worker_msgs[0].kind.as_str(), "job_assigned");
    assert_eq!(worker_msgs[0].payload["job_id"], job_id.to_string());
    assert_eq!(worker_msgs[0].payload["binary"], "ffmpeg");

    let client_msgs = repo.downlink_drain("alice", 10, Utc::now()).await.unwrap();
    assert_eq!(client_msgs.len(), 1);
    assert_eq!(client_msgs[0].kind.as_str(), "job_state_changed");
    assert_eq!(client_msgs[0].payload["state"], "assigned");
}

#[tokio::test]
async fn offline_workers_are_ignored() {
    let Setup { repo, scheduler } = setup();
    register(&repo, "w1", &["ffmpeg"], &["M"]).await;
    repo.worker_mark_offline("w1").await.unwrap();
    let job_id = submit(&repo, "ffmpeg", &["M"]).await;

    assert_eq!(scheduler.pass().await.unwrap(), 0);
    assert_eq!(
        repo.job_get(job_id).await.unwrap().unwrap().state,
        JobState::Pending
    );
}
