//! Retry, reclamation, cancellation and audit logging against a real
//! database.

use super::helpers::{SqliteStore, job, store};
use crate::test_helpers::worker;
use chrono::TimeDelta;
use leasehold::queue::domain::{LogLevel, TaskStatus};
use leasehold::queue::services::{
    EnqueueRequest, Finalization, HeartbeatStatus, Outcome, QueueError, StatusUpdate,
};
use rstest::rstest;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn task_fails_after_its_attempt_budget(store: SqliteStore) {
    let id = store.enqueue(job(b"").with_max_attempts(3)).await;
    let w1 = worker("w1");
    let mut handled = 0;

    while let Some(task) = store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim")
    {
        handled += 1;
        store
            .services
            .leases
            .finalize(task.id(), &w1, Outcome::retryable("flaky dependency"))
            .await
            .expect("finalize");
        store.services.clock.advance(TimeDelta::seconds(30));
    }

    assert_eq!(handled, 3);
    let view = store.services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.attempts, 3);
    assert_eq!(view.error_message.as_deref(), Some("flaky dependency"));
    assert!(view.finished_at.is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn retry_waits_for_backoff(store: SqliteStore) {
    let id = store.enqueue(job(b"")).await;
    let w1 = worker("w1");
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");

    let outcome = store
        .services
        .leases
        .finalize(id, &w1, Outcome::retryable("try later"))
        .await
        .expect("finalize");
    let too_soon = store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");
    store.services.clock.advance(TimeDelta::seconds(1));
    let on_time = store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");

    assert!(matches!(outcome, Finalization::Requeued { .. }));
    assert!(too_soon.is_none());
    assert_eq!(on_time.map(|task| task.id()), Some(id));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn expired_lease_is_reclaimed_for_another_worker(store: SqliteStore) {
    let id = store.enqueue(job(b"")).await;
    store
        .services
        .leases
        .claim_next(&worker("crashed"), None, None)
        .await
        .expect("claim");
    store.services.clock.advance(TimeDelta::seconds(301));

    let report = store
        .services
        .leases
        .reclaim_expired_leases()
        .await
        .expect("reclaim");
    store.services.clock.advance(TimeDelta::seconds(1));
    let rescued = store
        .services
        .leases
        .claim_next(&worker("rescuer"), None, None)
        .await
        .expect("claim");
    let late = store
        .services
        .leases
        .heartbeat(id, &worker("crashed"))
        .await;

    assert_eq!(report.reclaimed, vec![id]);
    let task = rescued.expect("task requeued");
    assert_eq!(task.id(), id);
    assert_eq!(task.attempts(), 1);
    assert!(matches!(late, Err(QueueError::LeaseLost { .. })), "{late:?}");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_extends_the_lease_past_reclamation(store: SqliteStore) {
    let id = store.enqueue(job(b"")).await;
    let w1 = worker("w1");
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");
    store.services.clock.advance(TimeDelta::seconds(200));
    let beat = store.services.leases.heartbeat(id, &w1).await.expect("heartbeat");
    store.services.clock.advance(TimeDelta::seconds(200));

    let report = store
        .services
        .leases
        .reclaim_expired_leases()
        .await
        .expect("reclaim");

    assert!(matches!(beat, HeartbeatStatus::Renewed { .. }));
    assert_eq!(report.examined, 0);
    let view = store.services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Leased);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cancelled_task_is_reported_to_its_worker(store: SqliteStore) {
    let id = store.enqueue(job(b"")).await;
    let w1 = worker("w1");
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");

    assert!(store.services.queue.cancel_task(id).await.expect("cancel"));
    let beat = store.services.leases.heartbeat(id, &w1).await.expect("heartbeat");
    let finished = store
        .services
        .leases
        .finalize(id, &w1, Outcome::Success(None))
        .await
        .expect("finalize");

    assert_eq!(beat, HeartbeatStatus::Cancelled);
    assert_eq!(finished, Finalization::Ignored);
    assert!(!store.services.queue.cancel_task(id).await.expect("cancel again"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn audit_log_follows_the_lifecycle(store: SqliteStore) {
    let id = store.enqueue(job(b"").with_max_attempts(2)).await;
    let w1 = worker("w1");
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim");
    store
        .services
        .leases
        .finalize(id, &w1, Outcome::retryable("first try"))
        .await
        .expect("finalize");
    store.services.clock.advance(TimeDelta::seconds(1));
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim")
        .expect("retry due");
    store
        .services
        .queue
        .update_status(id, StatusUpdate::new(TaskStatus::Failed).with_error_message("given up"))
        .await
        .expect("operator failure");

    let logs = store.services.queue.task_logs(id).await.expect("logs");

    let levels: Vec<LogLevel> = logs.iter().map(|entry| entry.level).collect();
    assert_eq!(
        levels,
        vec![
            LogLevel::Info,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Error
        ]
    );
    assert_eq!(logs.first().map(|entry| entry.message.as_str()), Some("enqueued"));
    assert_eq!(logs.get(1).map(|entry| entry.message.as_str()), Some("claimed"));
    let view = store.services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error_message.as_deref(), Some("given up"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stats_group_by_type_and_status(store: SqliteStore) {
    store.enqueue(job(b"")).await;
    let cancelled = store.enqueue(job(b"")).await;
    store
        .enqueue(EnqueueRequest::new("report", Vec::new()))
        .await;
    store.services.queue.cancel_task(cancelled).await.expect("cancel");

    let stats = store.services.queue.stats().await.expect("stats");

    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status.get(&TaskStatus::Queued), Some(&2));
    assert_eq!(stats.by_status.get(&TaskStatus::Cancelled), Some(&1));
    assert_eq!(stats.by_type_status.len(), 3);
}
