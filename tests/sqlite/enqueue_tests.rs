//! Enqueue, deduplication and payload fidelity.

use super::helpers::{SqliteStore, job, storage_at, store};
use crate::test_helpers::worker;
use leasehold::queue::adapters::sqlite::SqliteQueueRepository;
use leasehold::queue::domain::{TagSet, TaskFilter, TaskStatus};
use leasehold::queue::ports::QueueRepository;
use leasehold::queue::services::{Outcome, QueueError};
use rstest::rstest;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn idempotency_key_deduplicates(store: SqliteStore) {
    let queue = &store.services.queue;

    let first = queue
        .enqueue(job(b"first").with_idempotency_key("invoice-7"))
        .await
        .expect("enqueue");
    let second = queue
        .enqueue(job(b"second").with_idempotency_key("invoice-7"))
        .await
        .expect("enqueue");
    let other = queue
        .enqueue(job(b"other").with_idempotency_key("invoice-8"))
        .await
        .expect("enqueue");

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.task_id, second.task_id);
    assert_ne!(first.task_id, other.task_id);
    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.total, 2);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn oversized_attempt_budget_is_a_validation_error(store: SqliteStore) {
    let queue = &store.services.queue;

    let result = queue.enqueue(job(b"x").with_max_attempts(u32::MAX)).await;

    assert!(matches!(result, Err(QueueError::Validation(_))), "{result:?}");
    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.total, 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn binary_payload_and_result_round_trip(store: SqliteStore) {
    let payload: Vec<u8> = vec![0, 159, 146, 150, 255, b'\n', 0];
    let id = store.enqueue(job(&payload)).await;
    let w1 = worker("w1");
    store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim")
        .expect("task available");

    store
        .services
        .leases
        .finalize(id, &w1, Outcome::Success(Some(vec![0xde, 0xad, 0xbe, 0xef])))
        .await
        .expect("finalize");

    let task = store.services.queue.get_task(id).await.expect("task");
    assert_eq!(task.payload(), payload.as_slice());
    assert_eq!(task.result(), Some([0xde, 0xad, 0xbe, 0xef].as_slice()));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn tags_are_stored_and_filterable(store: SqliteStore) {
    let tagged = store
        .enqueue(job(b"").with_tags(["gpu=true".to_owned(), "region=eu".to_owned()]))
        .await;
    store.enqueue(job(b"")).await;

    let found = store
        .services
        .queue
        .list_tasks(&TaskFilter::new().with_tags(TagSet::parse(["region=eu"]).expect("tag")))
        .await
        .expect("list");

    assert_eq!(found.len(), 1);
    let summary = found.first().expect("one task");
    assert_eq!(summary.id, tagged);
    assert_eq!(summary.tags, vec!["gpu=true".to_owned(), "region=eu".to_owned()]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn tasks_survive_reopening_the_database(store: SqliteStore) {
    let id = store.enqueue(job(b"durable")).await;

    let reopened = SqliteQueueRepository::open(&storage_at(&store.dir)).expect("reopen");
    let task = reopened
        .find_by_id(id)
        .await
        .expect("find")
        .expect("task persisted");

    assert_eq!(task.status(), TaskStatus::Queued);
    assert_eq!(task.payload(), b"durable");
    assert!(store.database_path().is_file());
}
