//! Prometheus metrics for the queue.
//!
//! Each [`QueueMetrics`] owns its own [`Registry`]; nothing is registered
//! globally, so tests and embedded queues never collide.

use crate::queue::domain::TaskStatus;
use crate::queue::services::QueueStats;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or exporting metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric construction or registration failed.
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),

    /// The text encoder produced invalid UTF-8.
    #[error("metrics export is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Result of a claim attempt, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// A task was leased.
    Claimed,
    /// Nothing was eligible.
    Empty,
    /// The store reported an error.
    Error,
}

impl ClaimResult {
    const fn label(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Empty => "empty",
            Self::Error => "error",
        }
    }
}

/// Queue metric handles bound to a private registry.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    registry: Registry,
    tasks: IntGaugeVec,
    oldest_queued_age: IntGauge,
    claim_latency: HistogramVec,
    claims: IntCounterVec,
    reclaimed: IntCounter,
    transitions: IntCounterVec,
}

impl QueueMetrics {
    /// Creates and registers every queue metric in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registry`] if a metric cannot be built or
    /// registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let tasks = IntGaugeVec::new(
            Opts::new("leasehold_tasks", "Tasks by type and status"),
            &["task_type", "status"],
        )?;
        let oldest_queued_age = IntGauge::new(
            "leasehold_oldest_queued_age_seconds",
            "Age of the oldest queued task",
        )?;
        let claim_latency = HistogramVec::new(
            HistogramOpts::new(
                "leasehold_claim_latency_seconds",
                "Time spent in the claim transaction",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["strategy"],
        )?;
        let claims = IntCounterVec::new(
            Opts::new("leasehold_claims_total", "Claim attempts by result"),
            &["result"],
        )?;
        let reclaimed = IntCounter::new(
            "leasehold_reclaimed_leases_total",
            "Expired leases returned to the retry path",
        )?;
        let transitions = IntCounterVec::new(
            Opts::new("leasehold_transitions_total", "Status transitions by target status"),
            &["to"],
        )?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(oldest_queued_age.clone()))?;
        registry.register(Box::new(claim_latency.clone()))?;
        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(reclaimed.clone()))?;
        registry.register(Box::new(transitions.clone()))?;

        Ok(Self {
            registry,
            tasks,
            oldest_queued_age,
            claim_latency,
            claims,
            reclaimed,
            transitions,
        })
    }

    /// Returns the registry, for callers that expose it alongside their own
    /// metrics.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records one claim attempt.
    pub fn observe_claim(&self, strategy: &str, result: ClaimResult, elapsed: Duration) {
        self.claim_latency
            .with_label_values(&[strategy])
            .observe(elapsed.as_secs_f64());
        self.claims.with_label_values(&[result.label()]).inc();
    }

    /// Records a transition into `status`.
    pub fn record_transition(&self, status: TaskStatus) {
        self.transitions.with_label_values(&[status.as_str()]).inc();
    }

    /// Records reclaimed leases.
    pub fn record_reclaimed(&self, count: u64) {
        self.reclaimed.inc_by(count);
    }

    /// Replaces the task gauges with a fresh snapshot.
    pub fn update_from_stats(&self, stats: &QueueStats) {
        self.tasks.reset();
        for (task_type, status, count) in &stats.by_type_status {
            self.tasks
                .with_label_values(&[task_type.as_str(), status.as_str()])
                .set(i64::try_from(*count).unwrap_or(i64::MAX));
        }
        let age = stats
            .oldest_queued_age
            .map_or(0, |age| i64::try_from(age.as_secs()).unwrap_or(i64::MAX));
        self.oldest_queued_age.set(age);
    }

    /// Renders every metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when encoding fails.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
