//! Worker runtime tests: claim loops, heartbeats and shutdown.

use super::helpers::{
    MemoryServices, ScriptedHandler, services, wait_for_status, wait_until_drained,
};
use crate::test_helpers::{ManualClock, worker};
use leasehold::config::PollConfig;
use leasehold::queue::adapters::memory::InMemoryQueueRepository;
use leasehold::queue::domain::{TaskId, TaskStatus};
use leasehold::queue::ports::QueueRepository;
use leasehold::queue::services::{EnqueueRequest, Finalization};
use leasehold::worker::{RunOutcome, WorkerGroup, WorkerRunner};
use rstest::rstest;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

type Runner = WorkerRunner<InMemoryQueueRepository, ManualClock, ScriptedHandler>;

const fn fast_poll() -> PollConfig {
    PollConfig {
        min_interval_ms: 1,
        max_interval_ms: 10,
    }
}

fn runner(services: &MemoryServices, handler: &Arc<ScriptedHandler>, name: &str) -> Runner {
    WorkerRunner::new(Arc::clone(&services.leases), Arc::clone(handler), worker(name))
        .with_poll(fast_poll())
        .with_heartbeat_interval(Duration::from_millis(10))
}

async fn enqueue(services: &MemoryServices, payload: &str) -> TaskId {
    services
        .queue
        .enqueue(EnqueueRequest::new("job", payload.as_bytes().to_vec()).with_max_attempts(2))
        .await
        .expect("enqueue")
        .task_id
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn run_once_on_empty_queue_does_nothing(services: MemoryServices) {
    let handler = Arc::new(ScriptedHandler::default());

    let outcome = runner(&services, &handler, "idle")
        .run_once()
        .await
        .expect("run once");

    assert!(outcome.is_none());
    assert!(handler.seen().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn run_once_records_each_kind_of_outcome(services: MemoryServices) {
    let handler = Arc::new(ScriptedHandler::default());
    let ok = enqueue(&services, "hello").await;
    let flaky = enqueue(&services, "fail").await;
    let poison = enqueue(&services, "poison").await;
    let one = runner(&services, &handler, "w1");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(one.run_once().await.expect("run once"));
    }

    assert_eq!(
        outcomes.first(),
        Some(&Some(RunOutcome::Finalized(Finalization::Completed)))
    );
    assert!(matches!(
        outcomes.get(1),
        Some(Some(RunOutcome::Finalized(Finalization::Requeued { .. })))
    ));
    assert_eq!(
        outcomes.get(2),
        Some(&Some(RunOutcome::Finalized(Finalization::Failed)))
    );
    let completed = services.queue.get_task(ok).await.expect("task");
    assert_eq!(completed.result(), Some(b"HELLO".as_slice()));
    let retried = services.queue.get_task_status(flaky).await.expect("status");
    assert_eq!(retried.status, TaskStatus::Queued);
    assert_eq!(retried.attempts, 1);
    let failed = services.queue.get_task_status(poison).await.expect("status");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("cannot parse payload"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn group_runs_every_task_exactly_once(services: MemoryServices) {
    let handler = Arc::new(ScriptedHandler::default());
    let mut ids = BTreeSet::new();
    for n in 0..3 {
        ids.insert(enqueue(&services, &format!("task-{n}")).await);
    }
    let runners = (0..5)
        .map(|n| runner(&services, &handler, &format!("w{n}")))
        .collect();

    let group = WorkerGroup::spawn(runners);
    assert_eq!(group.len(), 5);
    let drained = wait_until_drained(&services, Duration::from_secs(5)).await;
    let report = group.shutdown_and_join().await;

    assert!(drained);
    assert_eq!(report.completed, 3);
    assert_eq!(report.total(), 3);
    let seen = handler.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), ids);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_a_running_handler(services: MemoryServices) {
    let handler = Arc::new(ScriptedHandler::default());
    let id = enqueue(&services, "hang").await;
    let one = runner(&services, &handler, "w1");

    let running = tokio::spawn(async move { one.run_once().await });
    assert!(wait_for_status(&services, id, TaskStatus::Leased, Duration::from_secs(5)).await);
    assert!(services.queue.cancel_task(id).await.expect("cancel"));
    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("runner notices cancellation")
        .expect("join")
        .expect("run once");

    assert_eq!(outcome, Some(RunOutcome::Abandoned));
    let view = services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Cancelled);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_idle_workers(services: MemoryServices) {
    let handler = Arc::new(ScriptedHandler::default());
    let group = WorkerGroup::spawn(vec![
        runner(&services, &handler, "a"),
        runner(&services, &handler, "b"),
    ]);

    let report = tokio::time::timeout(Duration::from_secs(5), group.shutdown_and_join())
        .await
        .expect("workers stop promptly");

    assert_eq!(report.total(), 0);
    let registered = services
        .repository
        .find_worker(&worker("a"))
        .await
        .expect("find worker");
    assert!(registered.is_some());
}
