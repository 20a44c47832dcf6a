//! End-to-end API tests over the in-memory stack: signed requests, the full
//! job lifecycle, cancellation, replay protection, and authorization.


use axum::http::StatusCode;
use chrono::Utc;

use dffmpeg_coordinator::model::Role;
use test_harness::{register_worker, sample_argv, submit_job, test_context};

/// Happy path: submit, assign, accept, log, complete.
#[tokio::test]
async fn job_lifecycle_happy_path() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    ctx.seed_identity("w1", Role::Worker).await;

    register_worker(&ctx, "w1", &["ffmpeg"], &["M", "TV"]).await;
    let job_id = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;

    // Submission wakes the scheduler; drive a pass directly here.
    assert_eq!(ctx.scheduler.pass().await.unwrap(), 1);

    let (status, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "alice", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "assigned");
    assert_eq!(json["assignee_id"], "w1");

    // The worker sees the assignment on its work poll.
    let (status, json) = ctx
        .send(ctx.signed_request(
            "GET",
            "/api/v1/workers/w1/work?wait_s=0",
            "w1",
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(json["jobs"][0]["job_id"], job_id);
    assert_eq!(json["jobs"][0]["binary"], "ffmpeg");

    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/accept"),
            "w1",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let log_body = serde_json::json!({
        "lines": [
            {"stream": "stdout", "text": "frame=  100"},
            {"stream": "stderr", "text": "warning: something"},
        ]
    });
    let (status, json) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/log"),
            "w1",
            Some(&log_body),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["first_seq"], 0);
    assert_eq!(json["last_seq"], 1);

    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/complete"),
            "w1",
            Some(&serde_json::json!({"exit_code": 0})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "alice", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "completed");
    assert_eq!(json["exit_code"], 0);

    // Stored logs have dense seq from 0.
    let (status, json) = ctx
        .send(ctx.signed_request(
            "GET",
            &format!("/api/v1/jobs/{job_id}/log"),
            "alice",
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let lines = json["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["seq"], 0);
    assert_eq!(lines[1]["seq"], 1);

    // The submitter's downlink carries the state-change notifications.
    let (status, json) = ctx
        .send(ctx.signed_request("GET", "/api/v1/downlink?wait_s=0", "alice", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = json["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"job_state_changed"));
    assert!(kinds.contains(&"log_append"));
    assert!(json["messages"][0]["schema"] == "v1");
}

/// Cancel while running: canceling, worker notified, worker confirms with a
/// signal exit code, job lands in canceled.
#[tokio::test]
async fn cancel_during_running() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    ctx.seed_identity("w1", Role::Worker).await;
    register_worker(&ctx, "w1", &["ffmpeg"], &["M"]).await;
    let job_id = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;
    ctx.scheduler.pass().await.unwrap();
    ctx.send(ctx.signed_request(
        "POST",
        &format!("/api/v1/jobs/{job_id}/accept"),
        "w1",
        Some(&serde_json::json!({})),
    ))
    .await;

    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            "alice",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "alice", None))
        .await;
    assert_eq!(json["state"], "canceling");

    // The worker's downlink carries the cancel request.
    let (_, json) = ctx
        .send(ctx.signed_request("GET", "/api/v1/downlink?wait_s=0", "w1", None))
        .await;
    let kinds: Vec<&str> = json["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"job_canceled"));

    // Worker terminates the subprocess and reports the signal exit code.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/complete"),
            "w1",
            Some(&serde_json::json!({"exit_code": 130})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "alice", None))
        .await;
    assert_eq!(json["state"], "canceled");
    assert_eq!(json["exit_code"], 130);

    // Cancel in a terminal state is a no-op.
    let (status, json) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            "alice",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["detail"], "job already finished");
}

#[tokio::test]
async fn cancel_pending_job_is_immediate() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    let job_id = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;

    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            "alice",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "alice", None))
        .await;
    assert_eq!(json["state"], "canceled");
}

/// Replay window: a request re-sent 31s after its timestamp is rejected; a
/// replay inside the window is accepted (no anti-nonce store).
#[tokio::test]
async fn hmac_replay_window() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;

    let stale = Utc::now().timestamp() - 31;
    let (status, _) = ctx
        .send(ctx.signed_request_at("GET", "/api/v1/jobs?limit=5", "alice", None, stale))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let fresh = Utc::now().timestamp() - 5;
    let (status, _) = ctx
        .send(ctx.signed_request_at("GET", "/api/v1/jobs?limit=5", "alice", None, fresh))
        .await;
    assert_eq!(status, StatusCode::OK);
    // Same signed request again, still inside the window: accepted.
    let (status, _) = ctx
        .send(ctx.signed_request_at("GET", "/api/v1/jobs?limit=5", "alice", None, fresh))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn requests_without_or_with_bad_credentials_are_rejected() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;

    // No auth headers at all.
    let bare = axum::http::Request::builder()
        .method("GET")
        .uri("/api/v1/jobs")
        .extension(axum::extract::connect_info::ConnectInfo(
            "127.0.0.1:5000".parse::<std::net::SocketAddr>().unwrap(),
        ))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = ctx.send(bare).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "auth_rejected");

    // Unknown identity.
    ctx.keys
        .insert("mallory".to_string(), ctx.keys["alice"].clone());
    let (status, _) = ctx
        .send(ctx.signed_request("GET", "/api/v1/jobs", "mallory", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Wrong key: sign alice's request with a different secret.
    ctx.keys.insert(
        "alice".to_string(),
        dffmpeg_coordinator::auth::RequestSigner::generate_key(),
    );
    let (status, _) = ctx
        .send(ctx.signed_request("GET", "/api/v1/jobs", "alice", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cidr_restrictions_are_enforced() {
    let mut ctx = test_context().await;
    // Identity restricted to a network the test peer (127.0.0.1) is not in.
    let key = dffmpeg_coordinator::auth::RequestSigner::generate_key();
    dffmpeg_coordinator::admin::put_identity(
        &ctx.repo,
        &dffmpeg_coordinator::auth::KeyRing::empty(),
        "remote-only",
        Role::Client,
        &key,
        vec!["10.0.0.0/8".parse().unwrap()],
        false,
    )
    .await
    .unwrap();
    ctx.keys.insert("remote-only".to_string(), key);

    let (status, _) = ctx
        .send(ctx.signed_request("GET", "/api/v1/jobs", "remote-only", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn role_and_ownership_checks() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    ctx.seed_identity("bob", Role::Client).await;
    ctx.seed_identity("w1", Role::Worker).await;
    ctx.seed_identity("w2", Role::Worker).await;

    register_worker(&ctx, "w1", &["ffmpeg"], &["M"]).await;
    let job_id = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;
    ctx.scheduler.pass().await.unwrap();

    // Workers cannot submit jobs.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            "/api/v1/jobs",
            "w1",
            Some(&serde_json::json!({"binary": "ffmpeg", "argv": sample_argv()})),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Another client cannot view or cancel alice's job.
    let (status, _) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{job_id}"), "bob", None))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/cancel"),
            "bob",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A different worker cannot accept the assignment.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/accept"),
            "w2",
            Some(&serde_json::json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Workers cannot poll another worker's queue.
    let (status, _) = ctx
        .send(ctx.signed_request("GET", "/api/v1/workers/w1/work?wait_s=0", "w2", None))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn submit_validation() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;

    // Unknown binary.
    let (status, json) = ctx
        .send(ctx.signed_request(
            "POST",
            "/api/v1/jobs",
            "alice",
            Some(&serde_json::json!({"binary": "rm", "argv": sample_argv()})),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_error");

    // Bad variable name in a var token.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            "/api/v1/jobs",
            "alice",
            Some(&serde_json::json!({
                "binary": "ffmpeg",
                "argv": [{"kind": "var", "variable": "not-valid", "subpath": "x"}],
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Empty argv.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            "/api/v1/jobs",
            "alice",
            Some(&serde_json::json!({"binary": "ffmpeg", "argv": []})),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No mutually supported transport.
    let (status, _) = ctx
        .send(ctx.signed_request(
            "POST",
            "/api/v1/jobs",
            "alice",
            Some(&serde_json::json!({
                "binary": "ffmpeg",
                "argv": sample_argv(),
                "transports": {"enabled": ["mqtt"]},
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;

    let missing = ulid::Ulid::new();
    let (status, json) = ctx
        .send(ctx.signed_request("GET", &format!("/api/v1/jobs/{missing}"), "alice", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");

    // Malformed job id is a validation error, not a 404.
    let (status, _) = ctx
        .send(ctx.signed_request("GET", "/api/v1/jobs/not-a-ulid", "alice", None))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_listing_is_submitter_scoped() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    ctx.seed_identity("bob", Role::Client).await;

    let mine = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;
    submit_job(&ctx, "bob", "ffmpeg", sample_argv()).await;

    let (status, json) = ctx
        .send(ctx.signed_request("GET", "/api/v1/jobs?limit=10", "alice", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_id"], mine);
}

#[tokio::test]
async fn worker_register_negotiates_transport() {
    let mut ctx = test_context().await;
    ctx.seed_identity("w1", Role::Worker).await;

    // Peer preference order wins within the enabled set.
    let body = serde_json::json!({
        "worker_id": "w1",
        "registration_interval_s": 15,
        "version": "1.0.0",
        "binaries": ["ffmpeg"],
        "variables": ["M"],
        "transports": {"enabled": ["amqp", "http_polling"]},
    });
    let (status, json) = ctx
        .send(ctx.signed_request("POST", "/api/v1/workers/register", "w1", Some(&body)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["chosen"], "http_polling");

    // A worker cannot register under someone else's id.
    let body = serde_json::json!({
        "worker_id": "w2",
        "registration_interval_s": 15,
        "version": "1.0.0",
        "binaries": ["ffmpeg"],
        "variables": ["M"],
    });
    let (status, _) = ctx
        .send(ctx.signed_request("POST", "/api/v1/workers/register", "w1", Some(&body)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn healthz_is_public() {
    let ctx = test_context().await;
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = ctx.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

/// Conflict surfaces as 409: two workers racing the same transition.
#[tokio::test]
async fn lost_transition_race_is_conflict() {
    let mut ctx = test_context().await;
    ctx.seed_identity("alice", Role::Client).await;
    ctx.seed_identity("w1", Role::Worker).await;
    register_worker(&ctx, "w1", &["ffmpeg"], &["M"]).await;
    let job_id = submit_job(&ctx, "alice", "ffmpeg", sample_argv()).await;
    ctx.scheduler.pass().await.unwrap();

    let accept = || {
        ctx.signed_request(
            "POST",
            &format!("/api/v1/jobs/{job_id}/accept"),
            "w1",
            Some(&serde_json::json!({})),
        )
    };
    let (status, _) = ctx.send(accept()).await;
    assert_eq!(status, StatusCode::OK);
    // Second accept: the job is no longer assigned.
    let (status, json) = ctx.send(accept()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "conflict");
}
