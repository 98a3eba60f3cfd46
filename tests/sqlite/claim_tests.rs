//! Claim ordering and mutual exclusion against a real database.

use super::helpers::{SqliteStore, job, store};
use crate::test_helpers::worker;
use chrono::TimeDelta;
use leasehold::queue::domain::{TagSet, TaskId};
use leasehold::queue::strategy::StrategyKind;
use rstest::rstest;
use std::collections::BTreeSet;
use std::sync::Arc;

async fn drain(store: &SqliteStore) -> Vec<TaskId> {
    let w1 = worker("drainer");
    let mut order = Vec::new();
    while let Some(task) = store
        .services
        .leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim")
    {
        order.push(task.id());
    }
    order
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn priority_strategy_claims_smallest_first(store: SqliteStore) {
    let five = store.enqueue(job(b"").with_priority(5)).await;
    let one = store.enqueue(job(b"").with_priority(1)).await;
    let three = store.enqueue(job(b"").with_priority(3)).await;

    assert_eq!(drain(&store).await, vec![one, three, five]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn priority_beats_age(store: SqliteStore) {
    let older = store.enqueue(job(b"A").with_priority(10)).await;
    store.services.clock.advance(TimeDelta::seconds(5));
    let newer = store.enqueue(job(b"B").with_priority(1)).await;

    assert_eq!(drain(&store).await, vec![newer, older]);
}

#[rstest]
#[case::fifo(StrategyKind::Fifo, false)]
#[case::lifo(StrategyKind::Lifo, true)]
#[tokio::test(flavor = "multi_thread")]
async fn age_strategies_ignore_priority(#[case] strategy: StrategyKind, #[case] newest_first: bool) {
    let store = SqliteStore::with_strategy(strategy);
    let mut created = Vec::new();
    for priority in [9, 0, 4] {
        created.push(store.enqueue(job(b"").with_priority(priority)).await);
        store.services.clock.advance(TimeDelta::seconds(1));
    }
    if newest_first {
        created.reverse();
    }

    assert_eq!(drain(&store).await, created);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn weighted_strategy_eventually_claims_everything() {
    let store = SqliteStore::with_strategy(StrategyKind::WeightedRandom);
    let mut created = BTreeSet::new();
    for priority in [0, 50, 500, 1_000] {
        created.insert(store.enqueue(job(b"").with_priority(priority)).await);
    }

    let claimed: BTreeSet<TaskId> = drain(&store).await.into_iter().collect();

    assert_eq!(claimed, created);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn five_workers_share_three_tasks_without_overlap(store: SqliteStore) {
    let mut created = BTreeSet::new();
    for _ in 0..3 {
        created.insert(store.enqueue(job(b"")).await);
    }

    let leases = Arc::clone(&store.services.leases);
    let claims: Vec<_> = (0..5)
        .map(|n| {
            let manager = Arc::clone(&leases);
            tokio::spawn(async move {
                manager
                    .claim_next(&worker(&format!("w{n}")), None, None)
                    .await
                    .expect("claim")
                    .map(|task| task.id())
            })
        })
        .collect();
    let mut won = Vec::new();
    for claim in claims {
        if let Some(id) = claim.await.expect("join") {
            won.push(id);
        }
    }

    assert_eq!(won.len(), 3);
    assert_eq!(won.into_iter().collect::<BTreeSet<_>>(), created);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn workers_only_claim_compatible_tasks(store: SqliteStore) {
    let gpu = store
        .enqueue(job(b"").with_tags(["gpu=true".to_owned()]))
        .await;
    let caps = TagSet::parse(["gpu=true"]).expect("tags");

    let cpu_only = store
        .services
        .leases
        .claim_next(&worker("cpu"), Some(&TagSet::default()), None)
        .await
        .expect("claim");
    let gpu_worker = store
        .services
        .leases
        .claim_next(&worker("gpu"), Some(&caps), None)
        .await
        .expect("claim");

    assert!(cpu_only.is_none());
    assert_eq!(gpu_worker.map(|task| task.id()), Some(gpu));
}
