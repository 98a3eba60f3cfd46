//! Prometheus series fed by the queue services.

use super::helpers::{job, storage_at};
use crate::test_helpers::{ManualClock, fixed_backoff, worker};
use chrono::TimeDelta;
use leasehold::config::LeaseConfig;
use leasehold::queue::adapters::sqlite::SqliteQueueRepository;
use leasehold::queue::metrics::QueueMetrics;
use leasehold::queue::services::{LeaseManager, QueueService};
use leasehold::queue::strategy::StrategyKind;
use rstest::rstest;
use std::sync::Arc;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn services_report_claims_reclaims_and_gauges() {
    let dir = tempfile::tempdir().expect("temp dir");
    let repository =
        Arc::new(SqliteQueueRepository::open(&storage_at(&dir)).expect("open database"));
    let clock = Arc::new(ManualClock::new());
    let metrics = Arc::new(QueueMetrics::new().expect("metrics registry"));
    let queue = QueueService::new(Arc::clone(&repository), Arc::clone(&clock))
        .with_metrics(Arc::clone(&metrics));
    let leases = LeaseManager::new(
        Arc::clone(&repository),
        Arc::clone(&clock),
        StrategyKind::Priority.build(4),
        LeaseConfig::default(),
        fixed_backoff(),
    )
    .with_metrics(Arc::clone(&metrics));
    let w1 = worker("w1");

    queue.enqueue(job(b"abandoned")).await.expect("enqueue");
    leases
        .claim_next(&w1, None, None)
        .await
        .expect("claim")
        .expect("task leased");
    let empty = leases.claim_next(&w1, None, None).await.expect("claim");
    clock.advance(TimeDelta::seconds(301));
    let report = leases.reclaim_expired_leases().await.expect("reclaim");
    queue.stats().await.expect("stats");

    let rendered = metrics.render().expect("render");

    assert!(empty.is_none());
    assert_eq!(report.reclaimed.len(), 1);
    for series in [
        "leasehold_claims_total{result=\"claimed\"} 1",
        "leasehold_claims_total{result=\"empty\"} 1",
        "leasehold_claim_latency_seconds_count{strategy=\"priority\"} 2",
        "leasehold_reclaimed_leases_total 1",
        "leasehold_transitions_total{to=\"leased\"} 1",
        "leasehold_transitions_total{to=\"queued\"} 2",
        "leasehold_tasks{status=\"queued\",task_type=\"job\"} 1",
        "leasehold_oldest_queued_age_seconds 301",
    ] {
        assert!(rendered.contains(series), "missing `{series}` in:\n{rendered}");
    }
}

#[rstest]
fn fresh_registry_renders_without_samples() {
    let metrics = QueueMetrics::new().expect("metrics registry");

    let rendered = metrics.render().expect("render");

    assert!(rendered.contains("leasehold_reclaimed_leases_total 0"));
    assert!(rendered.contains("leasehold_oldest_queued_age_seconds 0"));
    assert!(!rendered.contains("leasehold_tasks{"));
}
