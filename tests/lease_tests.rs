//! Lease expiry: requeue with head priority, retry accounting, failure after
//! the retry budget, and the background sweeper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use grid_server::config::ServerConfig;
use grid_server::scheduler::{JobResult, JobState, Outcome, PartitionKey, WorkerId};
use grid_server::{Dispatcher, GridError};
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(5);

fn p00() -> PartitionKey {
    PartitionKey::new(0, 0)
}

fn dispatcher(max_retries: u32) -> Dispatcher {
    Dispatcher::new(
        ServerConfig::default()
            .with_lease_ms(LEASE.as_millis() as u64)
            .with_max_retries(max_retries),
    )
}

#[tokio::test]
async fn test_expired_job_reappears_with_retry_count() {
    let d = dispatcher(3);
    let w = WorkerId::from("w1");
    let start = Instant::now();
    let id = d.submit_job(p00(), b"J".to_vec(), None).await.unwrap();

    let job = d.fetch_job_at(p00(), &w, start).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);

    // Still leased just before the deadline.
    let early = start + LEASE - Duration::from_millis(1);
    assert!(d.fetch_job_at(p00(), &w, early).await.unwrap().is_none());

    let again = d
        .fetch_job_at(p00(), &WorkerId::from("w2"), start + LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.retry_count, 1);
    assert_eq!(again.assigned_worker(), Some(&WorkerId::from("w2")));
}

#[tokio::test]
async fn test_reclaimed_job_jumps_ahead_of_fresh_jobs() {
    let d = dispatcher(3);
    let w = WorkerId::from("w1");
    let start = Instant::now();
    let first = d.submit_job(p00(), vec![1], None).await.unwrap();
    d.fetch_job_at(p00(), &w, start).await.unwrap().unwrap();
    let fresh = d.submit_job(p00(), vec![2], None).await.unwrap();

    let summary = d.sweep_expired_at(start + LEASE).await;
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.failed, 0);

    let later = start + LEASE;
    assert_eq!(d.fetch_job_at(p00(), &w, later).await.unwrap().unwrap().id, first);
    assert_eq!(d.fetch_job_at(p00(), &w, later).await.unwrap().unwrap().id, fresh);
}

#[tokio::test]
async fn test_stale_worker_loses_after_reclaim() {
    let d = dispatcher(3);
    let slow = WorkerId::from("slow");
    let fast = WorkerId::from("fast");
    let start = Instant::now();
    let id = d.submit_job(p00(), vec![], None).await.unwrap();

    d.fetch_job_at(p00(), &slow, start).await.unwrap();
    d.sweep_expired_at(start + LEASE).await;

    // Requeued but not yet re-fetched.
    let err = d
        .submit_result(JobResult::new(id, Outcome::success(vec![])), Some(&slow))
        .await
        .unwrap_err();
    assert_eq!(err, GridError::NotAssigned(id));
    assert!(err.is_benign());

    d.fetch_job_at(p00(), &fast, start + LEASE).await.unwrap();
    let err = d
        .submit_result(JobResult::new(id, Outcome::success(vec![])), Some(&slow))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::NotOwner { .. }));

    d.submit_result(JobResult::new(id, Outcome::success(b"ok".to_vec())), Some(&fast))
        .await
        .unwrap();
    let results = d.fetch_results(None, None).await.unwrap();
    assert_eq!(results, vec![JobResult::new(id, Outcome::success(b"ok".to_vec()))]);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_yields_error_result() {
    let max_retries = 3;
    let d = dispatcher(max_retries);
    let w = WorkerId::from("w1");
    let id = d.submit_job(p00(), vec![], None).await.unwrap();

    let mut now = Instant::now();
    let mut last_retry = None;
    for expected_retry in 0..=max_retries {
        let job = d.fetch_job_at(p00(), &w, now).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.retry_count, expected_retry);
        if let Some(prev) = last_retry {
            assert!(job.retry_count > prev);
        }
        last_retry = Some(job.retry_count);
        now += LEASE;
        d.sweep_expired_at(now).await;
    }

    let job = d.job(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, max_retries);
    assert!(d.fetch_job_at(p00(), &w, now).await.unwrap().is_none());
    assert_eq!(d.status().await.partitions[0].pending, 0);

    let results = d.fetch_results(None, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id, id);
    assert!(results[0].outcome.is_error());

    // Never comes back.
    d.sweep_expired_at(now + LEASE * 10).await;
    assert!(d.fetch_job_at(p00(), &w, now + LEASE * 10).await.unwrap().is_none());
    assert!(d.fetch_results(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_retries_fails_on_first_expiry() {
    let d = dispatcher(0);
    let start = Instant::now();
    let id = d.submit_job(p00(), vec![], None).await.unwrap();
    d.fetch_job_at(p00(), &WorkerId::from("w1"), start)
        .await
        .unwrap();

    let summary = d.sweep_expired_at(start + LEASE).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(d.job(id).await.unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn test_failed_result_goes_to_submitting_client() {
    let d = dispatcher(0);
    let client = d.register_client("batch").await;
    let start = Instant::now();
    let id = d.submit_job(p00(), vec![], Some(client)).await.unwrap();
    d.fetch_job_at(p00(), &WorkerId::from("w1"), start)
        .await
        .unwrap();
    d.sweep_expired_at(start + LEASE).await;

    assert!(d.fetch_results(None, None).await.unwrap().is_empty());
    let results = d.fetch_results(Some(client), None).await.unwrap();
    assert_eq!(results[0].job_id, id);
    assert!(results[0].outcome.is_error());
}

#[tokio::test]
async fn test_lease_override_per_partition() {
    let short = PartitionKey::new(9, 0);
    let d = Dispatcher::new(
        ServerConfig::default()
            .with_lease_ms(60_000)
            .with_lease_override(short, 100),
    );
    let w = WorkerId::from("w1");
    let start = Instant::now();
    d.submit_job(short, vec![], None).await.unwrap();
    d.submit_job(p00(), vec![], None).await.unwrap();
    d.fetch_job_at(short, &w, start).await.unwrap().unwrap();
    d.fetch_job_at(p00(), &w, start).await.unwrap().unwrap();

    let summary = d
        .sweep_expired_at(start + Duration::from_millis(100))
        .await;
    assert_eq!(summary.requeued, 1);

    let status = d.status().await;
    let short_status = status
        .partitions
        .iter()
        .find(|p| p.service_id == 9)
        .unwrap();
    assert_eq!(short_status.pending, 1);
    assert_eq!(short_status.lease_ms, 100);
}

#[tokio::test]
async fn test_background_sweeper_reclaims_leases() {
    let d = Arc::new(Dispatcher::new(
        ServerConfig::default()
            .with_lease_ms(50)
            .with_sweep_interval_ms(10),
    ));
    let shutdown = CancellationToken::new();
    let sweeper = d.clone().spawn_sweeper(shutdown.clone());

    let id = d.submit_job(p00(), vec![], None).await.unwrap();
    d.fetch_job(p00(), &WorkerId::from("w1")).await.unwrap().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let job = d.job(id).await.unwrap();
        if job.state == JobState::Pending {
            assert_eq!(job.retry_count, 1);
            break;
        }
        assert!(Instant::now() < deadline, "Sweeper should requeue the job");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("Sweeper should stop on cancellation")
        .unwrap();
}

#[tokio::test]
async fn test_sweeper_survives_zero_interval() {
    let d = Arc::new(Dispatcher::new(
        ServerConfig::default()
            .with_lease_ms(20)
            .with_sweep_interval_ms(0),
    ));
    let shutdown = CancellationToken::new();
    let sweeper = d.clone().spawn_sweeper(shutdown.clone());

    let id = d.submit_job(p00(), vec![], None).await.unwrap();
    d.fetch_job(p00(), &WorkerId::from("w1")).await.unwrap().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while d.job(id).await.unwrap().state != JobState::Pending {
        assert!(Instant::now() < deadline, "Sweeper should keep running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("Sweeper should stop on cancellation")
        .expect("Sweeper should not panic");
}

#[tokio::test]
async fn test_exchange_never_returns_the_reported_job() {
    let d = dispatcher(3);
    let w = WorkerId::from("w1");
    let start = Instant::now();
    let first = d.submit_job(p00(), vec![1], None).await.unwrap();
    let second = d.submit_job(p00(), vec![2], None).await.unwrap();
    d.fetch_job_at(p00(), &w, start).await.unwrap().unwrap();

    // Reclaimed before the worker reports back.
    let later = start + LEASE;
    d.sweep_expired_at(later).await;
    let next = d
        .exchange_at(
            p00(),
            &w,
            Some(JobResult::new(first, Outcome::success(vec![]))),
            later,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, second);

    // The reclaimed job is still first in line for everyone else.
    let other = d
        .fetch_job_at(p00(), &WorkerId::from("w2"), later)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.id, first);
    assert_eq!(other.retry_count, 1);
}

#[tokio::test]
async fn test_exchange_completes_lease_that_expired_unswept() {
    let d = dispatcher(3);
    let w = WorkerId::from("w1");
    let start = Instant::now();
    let id = d.submit_job(p00(), vec![], None).await.unwrap();
    d.fetch_job_at(p00(), &w, start).await.unwrap().unwrap();

    let later = start + LEASE;
    let next = d
        .exchange_at(
            p00(),
            &w,
            Some(JobResult::new(id, Outcome::success(vec![]))),
            later,
        )
        .await
        .unwrap();
    assert!(next.is_none());
    assert_eq!(d.job(id).await.unwrap().state, JobState::Completed);
}

