//! Repository-layer tests, run against both engines where behavior must
//! match: transitions, dense log sequencing, downlink drain semantics, and
//! the concurrent-assignment race.

use std::collections::{BTreeSet, HashSet};

use chrono::{Duration, Utc};
use ulid::Ulid;

use dffmpeg_coordinator::config::TableNames;
use dffmpeg_coordinator::model::{
    DownlinkKind, DownlinkMessage, Job, JobMode, JobState, LogStream,
};
use dffmpeg_coordinator::pathvar::ArgvToken;
use dffmpeg_coordinator::repo::{
    MemoryRepository, NewLogLine, RepoError, Repository, SqliteRepository, TransitionUpdate,
    WorkerCandidate, WorkerRegistration,
};

fn memory_repo() -> Repository {
    Repository::Memory(MemoryRepository::new())
}

fn sqlite_repo() -> Repository {
    Repository::Sqlite(
        SqliteRepository::open_in_memory(TableNames::default()).expect("in-memory sqlite opens"),
    )
}

fn both_engines() -> Vec<Repository> {
    vec![memory_repo(), sqlite_repo()]
}

fn sample_job(submitter: &str) -> Job {
    let argv = vec![
        ArgvToken::Literal {
            value: "-i".to_string(),
        },
        ArgvToken::Var {
            variable: "M".to_string(),
            subpath: "a.mkv".to_string(),
        },
        ArgvToken::Literal {
            value: "b.mp4".to_string(),
        },
    ];
    Job::new(
        Ulid::new(),
        submitter.to_string(),
        "ffmpeg".to_string(),
        argv,
        ["M".to_string()].into_iter().collect(),
        JobMode::Detached,
        Some("http_polling".to_string()),
        15,
        Utc::now(),
    )
}

fn candidate(worker_id: &str, binaries: &[&str], variables: &[&str], running: usize) -> WorkerCandidate {
    WorkerCandidate {
        worker_id: worker_id.to_string(),
        binaries: binaries.iter().map(|s| s.to_string()).collect(),
        variables: variables.iter().map(|s| s.to_string()).collect(),
        running,
    }
}

fn registration(worker_id: &str) -> WorkerRegistration {
    WorkerRegistration {
        worker_id: worker_id.to_string(),
        registration_interval_s: 15,
        version: "1.0.0".to_string(),
        advertised_binaries: ["ffmpeg".to_string()].into_iter().collect(),
        advertised_variables: ["M".to_string(), "TV".to_string()].into_iter().collect(),
        transport_choice: Some("http_polling".to_string()),
    }
}

#[tokio::test]
async fn submit_and_get_round_trip() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();

        let loaded = repo.job_get(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Pending);
        assert_eq!(loaded.submitter_id, "alice");
        assert_eq!(loaded.binary, "ffmpeg");
        assert_eq!(loaded.argv, job.argv);
        assert_eq!(
            loaded.required_variables,
            ["M".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(loaded.assignee_id.is_none());
    }
}

#[tokio::test]
async fn conditional_transition_conflicts() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();
        let now = Utc::now();

        // pending -> canceled works once...
        repo.job_transition(
            job.job_id,
            &[JobState::Pending],
            JobState::Canceled,
            TransitionUpdate::default(),
            now,
        )
        .await
        .unwrap();

        // ...and a second writer expecting pending loses the race.
        let err = repo
            .job_transition(
                job.job_id,
                &[JobState::Pending],
                JobState::Canceled,
                TransitionUpdate::default(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));

        // Terminal states are absorbing: nothing transitions out.
        let err = repo
            .job_transition(
                job.job_id,
                &[
                    JobState::Pending,
                    JobState::Assigned,
                    JobState::Running,
                    JobState::Canceling,
                ],
                JobState::Running,
                TransitionUpdate::default(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }
}

#[tokio::test]
async fn transition_on_missing_job_is_not_found() {
    for repo in both_engines() {
        let err = repo
            .job_transition(
                Ulid::new(),
                &[JobState::Pending],
                JobState::Canceled,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound(_)));
    }
}

#[tokio::test]
async fn log_seq_is_dense_from_zero() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();
        let now = Utc::now();

        let lines = |texts: &[&str]| -> Vec<NewLogLine> {
            texts
                .iter()
                .map(|t| NewLogLine {
                    stream: LogStream::Stdout,
                    text: t.to_string(),
                    emitted_at: now,
                })
                .collect()
        };

        let (first, last) = repo.job_append_log(job.job_id, lines(&["a", "b"])).await.unwrap();
        assert_eq!((first, last), (0, 1));
        let (first, last) = repo.job_append_log(job.job_id, lines(&["c"])).await.unwrap();
        assert_eq!((first, last), (2, 2));

        let chunks = repo.job_logs(job.job_id, None, None).await.unwrap();
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        // since_seq is exclusive.
        let tail = repo.job_logs(job.job_id, Some(0), None).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 1);
    }
}

#[tokio::test]
async fn log_emitted_at_is_monotone() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();
        let now = Utc::now();

        // A worker with a skewed clock sends an older timestamp second.
        let lines = vec![
            NewLogLine {
                stream: LogStream::Stdout,
                text: "first".to_string(),
                emitted_at: now,
            },
            NewLogLine {
                stream: LogStream::Stdout,
                text: "second".to_string(),
                emitted_at: now - Duration::seconds(10),
            },
        ];
        repo.job_append_log(job.job_id, lines).await.unwrap();

        let chunks = repo.job_logs(job.job_id, None, None).await.unwrap();
        assert!(chunks.windows(2).all(|w| w[0].emitted_at <= w[1].emitted_at));
    }
}

#[tokio::test]
async fn concurrent_log_appends_never_interleave_seqs() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            let job_id = job.job_id;
            handles.push(tokio::spawn(async move {
                let lines = vec![
                    NewLogLine {
                        stream: LogStream::Stdout,
                        text: format!("batch {i} line 0"),
                        emitted_at: Utc::now(),
                    },
                    NewLogLine {
                        stream: LogStream::Stderr,
                        text: format!("batch {i} line 1"),
                        emitted_at: Utc::now(),
                    },
                ];
                repo.job_append_log(job_id, lines).await.unwrap()
            }));
        }
        let mut ranges = Vec::new();
        for handle in handles {
            ranges.push(handle.await.unwrap());
        }

        // Every batch got a contiguous range and no seq was issued twice.
        let mut all_seqs = HashSet::new();
        for (first, last) in ranges {
            assert_eq!(last, first + 1);
            assert!(all_seqs.insert(first));
            assert!(all_seqs.insert(last));
        }
        let chunks = repo.job_logs(job.job_id, None, None).await.unwrap();
        assert_eq!(chunks.len(), 16);
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, (0..16).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn worker_register_is_idempotent() {
    for repo in both_engines() {
        let now = Utc::now();
        repo.worker_register(registration("w1"), now).await.unwrap();
        let later = now + Duration::seconds(5);
        let mut reg = registration("w1");
        reg.advertised_variables.insert("EXTRA".to_string());
        repo.worker_register(reg, later).await.unwrap();

        let worker = repo.worker_get("w1").await.unwrap().unwrap();
        // Compare at millisecond precision: sqlite stores unix millis.
        assert_eq!(worker.last_seen_at.timestamp_millis(), later.timestamp_millis());
        assert!(worker.advertised_variables.contains("EXTRA"));
        // First registration time survives re-registration.
        assert_eq!(worker.registered_at.timestamp_millis(), now.timestamp_millis());
    }
}

#[tokio::test]
async fn worker_heartbeat_unknown_worker() {
    for repo in both_engines() {
        let err = repo.worker_heartbeat("ghost", Utc::now()).await.unwrap_err();
        assert!(matches!(err, RepoError::UnknownWorker(_)));
    }
}

#[tokio::test]
async fn job_heartbeat_only_in_active_states() {
    for repo in both_engines() {
        let job = sample_job("alice");
        repo.jobs_submit(job.clone()).await.unwrap();
        let now = Utc::now();

        // pending: rejected
        let err = repo.job_heartbeat(job.job_id, now).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));

        repo.job_transition(
            job.job_id,
            &[JobState::Pending],
            JobState::Assigned,
            TransitionUpdate {
                assignee: Some(Some("w1".to_string())),
                ..TransitionUpdate::default()
            },
            now,
        )
        .await
        .unwrap();
        repo.job_heartbeat(job.job_id, now + Duration::seconds(1))
            .await
            .unwrap();

        // Heartbeats never go backwards.
        repo.job_heartbeat(job.job_id, now - Duration::seconds(60))
            .await
            .unwrap();
        let loaded = repo.job_get(job.job_id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_heartbeat_at.map(|t| t.timestamp_millis()),
            Some((now + Duration::seconds(1)).timestamp_millis())
        );
    }
}

#[tokio::test]
async fn assign_one_picks_oldest_pending() {
    for repo in both_engines() {
        let first = sample_job("alice");
        repo.jobs_submit(first.clone()).await.unwrap();
        // ULIDs created later sort later.
        let second = sample_job("alice");
        repo.jobs_submit(second.clone()).await.unwrap();

        let candidates = vec![candidate("w1", &["ffmpeg"], &["M"], 0)];
        let assignment = repo
            .jobs_assign_one(&candidates, None, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.job_id, first.job_id);
        assert_eq!(assignment.worker_id, "w1");

        let loaded = repo.job_get(first.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Assigned);
        assert_eq!(loaded.assignee_id.as_deref(), Some("w1"));
        assert!(loaded.assigned_at.is_some());
    }
}

#[tokio::test]
async fn assign_one_respects_capability_filters() {
    for repo in both_engines() {
        let job = sample_job("alice"); // requires ffmpeg + {M}
        repo.jobs_submit(job.clone()).await.unwrap();

        // Wrong binary.
        let none = repo
            .jobs_assign_one(&[candidate("w1", &["ffprobe"], &["M"], 0)], None, Utc::now())
            .await
            .unwrap();
        assert!(none.is_none());

        // Missing variable.
        let none = repo
            .jobs_assign_one(&[candidate("w1", &["ffmpeg"], &["TV"], 0)], None, Utc::now())
            .await
            .unwrap();
        assert!(none.is_none());
        // Neither attempt could ever run the job, so it stays not-eligible.
        let loaded = repo.job_get(job.job_id).await.unwrap().unwrap();
        assert!(!loaded.ever_eligible);

        // Capable but over the soft limit: marked eligible, not assigned.
        let none = repo
            .jobs_assign_one(&[candidate("w1", &["ffmpeg"], &["M", "TV"], 3)], Some(3), Utc::now())
            .await
            .unwrap();
        assert!(none.is_none());
        let loaded = repo.job_get(job.job_id).await.unwrap().unwrap();
        assert!(loaded.ever_eligible);

        // Under the limit: assigned.
        let assignment = repo
            .jobs_assign_one(&[candidate("w1", &["ffmpeg"], &["M", "TV"], 2)], Some(3), Utc::now())
            .await
            .unwrap();
        assert!(assignment.is_some());
    }
}

/// Property: under concurrent assignment callers, no job is ever assigned
/// twice.
#[tokio::test]
async fn concurrent_assign_one_never_double_assigns() {
    let repo = memory_repo();
    let mut job_ids = HashSet::new();
    for _ in 0..20 {
        let job = sample_job("alice");
        job_ids.insert(job.job_id);
        repo.jobs_submit(job).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let me = format!("w{i}");
            let mut won = Vec::new();
            loop {
                let candidates = vec![candidate(&me, &["ffmpeg"], &["M"], won.len())];
                match repo.jobs_assign_one(&candidates, None, Utc::now()).await.unwrap() {
                    Some(assignment) => won.push(assignment.job_id),
                    None => break,
                }
            }
            won
        }));
    }

    let mut assigned = Vec::new();
    for handle in handles {
        assigned.extend(handle.await.unwrap());
    }

    let unique: HashSet<Ulid> = assigned.iter().copied().collect();
    assert_eq!(unique.len(), assigned.len(), "a job was assigned twice");
    assert_eq!(unique, job_ids, "every job got assigned exactly once");
}

#[tokio::test]
async fn downlink_drain_removes_messages_in_order() {
    for repo in both_engines() {
        let now = Utc::now();
        for i in 0..3 {
            repo.downlink_enqueue(DownlinkMessage::to_client(
                "alice",
                DownlinkKind::JobStateChanged,
                None,
                serde_json::json!({"i": i}),
                now,
            ))
            .await
            .unwrap();
        }
        repo.downlink_enqueue(DownlinkMessage::to_client(
            "bob",
            DownlinkKind::Ping,
            None,
            serde_json::json!({}),
            now,
        ))
        .await
        .unwrap();

        let first = repo.downlink_drain("alice", 2, now).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload["i"], 0);
        assert_eq!(first[1].payload["i"], 1);
        assert!(first.iter().all(|m| m.delivered_at.is_some()));

        let second = repo.downlink_drain("alice", 10, now).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload["i"], 2);

        // Drained means gone; bob's queue is untouched.
        assert!(repo.downlink_drain("alice", 10, now).await.unwrap().is_empty());
        assert_eq!(repo.downlink_drain("bob", 10, now).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn jobs_query_filters_and_paginates() {
    for repo in both_engines() {
        let mine = sample_job("alice");
        repo.jobs_submit(mine.clone()).await.unwrap();
        let other = sample_job("bob");
        repo.jobs_submit(other.clone()).await.unwrap();

        let jobs = repo
            .jobs_query(&dffmpeg_coordinator::repo::JobFilter {
                submitter: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, mine.job_id);

        // Terminal jobs outside the recent window disappear from listings.
        let cutoff_now = Utc::now();
        repo.job_transition(
            mine.job_id,
            &[JobState::Pending],
            JobState::Canceled,
            TransitionUpdate::default(),
            cutoff_now - Duration::hours(2),
        )
        .await
        .unwrap();
        let jobs = repo
            .jobs_query(&dffmpeg_coordinator::repo::JobFilter {
                submitter: Some("alice".to_string()),
                ended_after: Some(cutoff_now - Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }
}

/// Path-blindness: nothing the coordinator writes into sqlite contains an
/// absolute filesystem path, as long as clients submit tokenized argv.
#[tokio::test]
async fn sqlite_stores_no_absolute_paths() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("coordinator.db");
    let repo = Repository::Sqlite(
        SqliteRepository::open(&db_path, TableNames::default()).unwrap(),
    );

    repo.worker_register(registration("w1"), Utc::now()).await.unwrap();
    let job = sample_job("alice");
    repo.jobs_submit(job.clone()).await.unwrap();
    repo.job_append_log(
        job.job_id,
        vec![NewLogLine {
            stream: LogStream::Stdout,
            text: "frame=  100 fps= 25".to_string(),
            emitted_at: Utc::now(),
        }],
    )
    .await
    .unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    for table in ["jobs", "workers", "job_logs", "downlink_messages"] {
        let mut stmt = conn.prepare(&format!("SELECT * FROM {table}")).unwrap();
        let column_count = stmt.column_count();
        let mut rows = stmt.query([]).unwrap();
        while let Some(row) = rows.next().unwrap() {
            for idx in 0..column_count {
                if let Ok(value) = row.get::<_, String>(idx) {
                    assert!(
                        !looks_like_absolute_path(&value),
                        "absolute path leaked into {table}: {value:?}"
                    );
                }
            }
        }
    }
}

fn looks_like_absolute_path(value: &str) -> bool {
    let unix = value.starts_with('/');
    let windows = value.len() >= 3
        && value.as_bytes()[0].is_ascii_alphabetic()
        && &value[1..3] == ":\\";
    unix || windows
}
