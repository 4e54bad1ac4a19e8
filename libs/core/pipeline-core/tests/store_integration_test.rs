//! Integration tests for `StoreClient` against a real Redis container.
//!
//! Grounded on `libs/notifications/email`'s `tests/integration_test.rs` —
//! same `test_utils::TestRedis` + `#[tokio::test]` shape, adapted from the
//! email crate's stream producer/consumer round-trip to this crate's
//! key-value job store.

use pipeline_core::{BackoffConfig, Job, JobStatus, StoreClient, TtlPolicy};
use std::collections::HashMap;
use std::time::Duration;
use test_utils::TestRedis;

fn short_ttl() -> TtlPolicy {
    TtlPolicy {
        completed_secs: 1,
        failed_secs: 1,
        active_secs: 0,
    }
}

async fn connected_client(redis: &TestRedis, ttl: TtlPolicy) -> StoreClient {
    let backoff = BackoffConfig::new(Duration::from_millis(50), Duration::from_millis(200), 3);
    let client = StoreClient::new(redis.connection_string(), ttl, Duration::from_secs(30), backoff);
    assert!(client.connect().await.is_ok());
    client
}

#[tokio::test]
async fn save_job_then_get_job_round_trips() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    let mut metadata = HashMap::new();
    metadata.insert("video_id".to_string(), serde_json::json!("vid-1"));
    let job = Job::new("job-round-trip", metadata);

    assert!(client.save_job(&job).await);
    let fetched = client.get_job(&job.id).await.expect("job must exist");

    assert_eq!(fetched, job);
}

#[tokio::test]
async fn get_job_returns_none_for_missing_id() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    assert!(client.get_job("does-not-exist").await.is_none());
}

#[tokio::test]
async fn update_phase_appends_terminal_event_to_log() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    let job = Job::new("job-phases", HashMap::new());
    assert!(client.save_job(&job).await);

    assert!(
        client
            .update_phase(&job.id, JobStatus::Downloading, "downloader", HashMap::new())
            .await
    );
    assert!(
        client
            .update_phase(&job.id, JobStatus::Completed, "translator", HashMap::new())
            .await
    );

    let updated = client.get_job(&job.id).await.expect("job must still exist");
    assert_eq!(updated.status, JobStatus::Completed);
    assert!(updated.updated_at >= updated.created_at);

    // Invariant (spec.md §8.2): a job that reaches a terminal status has at
    // least one event whose type matches that status.
    let events = client.get_job_events(&job.id, None).await;
    assert!(events.iter().any(|e| e.event_type.contains("completed")));

    // Readers see newest-first.
    assert_eq!(events[0].event_type, "job.phase.completed");
    assert_eq!(events[1].event_type, "job.phase.downloading");
}

#[tokio::test]
async fn update_phase_on_missing_job_returns_false() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    assert!(
        !client
            .update_phase("missing-job", JobStatus::Completed, "source", HashMap::new())
            .await
    );
}

#[tokio::test]
async fn completed_job_expires_after_its_ttl() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    let mut job = Job::new("job-expiring", HashMap::new());
    job.status = JobStatus::Completed;
    assert!(client.save_job(&job).await);

    assert!(client.get_job(&job.id).await.is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.get_job(&job.id).await.is_none());
}

#[tokio::test]
async fn active_job_has_no_expiry() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    let job = Job::new("job-active", HashMap::new());
    assert!(client.save_job(&job).await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.get_job(&job.id).await.is_some());
}

#[tokio::test]
async fn list_jobs_excludes_event_log_keys() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    let job_a = Job::new("job-a", HashMap::new());
    let job_b = Job::new("job-b", HashMap::new());
    assert!(client.save_job(&job_a).await);
    assert!(client.save_job(&job_b).await);
    client
        .record_event(&job_a.id, &pipeline_core::EventRecord::new("job.created", "test", HashMap::new()))
        .await;

    let jobs = client.list_jobs().await;
    let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert!(ids.contains(&"job-a"));
    assert!(ids.contains(&"job-b"));
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn is_healthy_true_after_connect_and_false_after_close() {
    let redis = TestRedis::new().await;
    let client = connected_client(&redis, short_ttl()).await;

    assert!(client.is_healthy().await);
    client.close().await;
    assert!(!client.is_healthy().await);
}
