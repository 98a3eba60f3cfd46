//! Claim strategies decide which eligible task a worker receives.
//!
//! A strategy declares how candidates are ordered and how many the store
//! should fetch; the store runs that query inside the claim transaction and
//! asks the strategy to pick one. Strategies never touch storage.

use crate::queue::domain::Task;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Candidate ordering a store must apply before handing rows to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Oldest first: `(created_at, id)` ascending.
    OldestFirst,
    /// Newest first: `(created_at, id)` descending.
    NewestFirst,
    /// Highest precedence first: `(priority, created_at, id)` ascending.
    PriorityFirst,
}

impl CandidateOrder {
    /// Compares two tasks under this ordering.
    #[must_use]
    pub fn compare(self, left: &Task, right: &Task) -> std::cmp::Ordering {
        let by_age = || {
            left.created_at()
                .cmp(&right.created_at())
                .then_with(|| left.id().cmp(&right.id()))
        };
        match self {
            Self::OldestFirst => by_age(),
            Self::NewestFirst => by_age().reverse(),
            Self::PriorityFirst => left.priority().cmp(&right.priority()).then_with(by_age),
        }
    }
}

/// Pure selection policy over ordered candidates.
pub trait ClaimStrategy: Send + Sync + fmt::Debug {
    /// Stable name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Ordering the store applies to eligible candidates.
    fn ordering(&self) -> CandidateOrder;

    /// Number of ordered candidates the store fetches.
    fn window(&self) -> usize {
        1
    }

    /// Picks one of `candidates`, which arrive in [`ordering`](Self::ordering)
    /// order. Returns `None` only when `candidates` is empty.
    fn select_candidate<'a>(&self, candidates: &'a [Task]) -> Option<&'a Task>;
}

/// Oldest eligible task first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoStrategy;

impl ClaimStrategy for FifoStrategy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn ordering(&self) -> CandidateOrder {
        CandidateOrder::OldestFirst
    }

    fn select_candidate<'a>(&self, candidates: &'a [Task]) -> Option<&'a Task> {
        candidates.first()
    }
}

/// Newest eligible task first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifoStrategy;

impl ClaimStrategy for LifoStrategy {
    fn name(&self) -> &'static str {
        "lifo"
    }

    fn ordering(&self) -> CandidateOrder {
        CandidateOrder::NewestFirst
    }

    fn select_candidate<'a>(&self, candidates: &'a [Task]) -> Option<&'a Task> {
        candidates.first()
    }
}

/// Lowest priority value first, ties broken by age.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityStrategy;

impl ClaimStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn ordering(&self) -> CandidateOrder {
        CandidateOrder::PriorityFirst
    }

    fn select_candidate<'a>(&self, candidates: &'a [Task]) -> Option<&'a Task> {
        candidates.first()
    }
}

/// Random pick among the top candidates, weighted towards low priority
/// values.
///
/// A candidate with priority `p` has weight `1 / (p + 1)`. When the window
/// holds negative priorities, values are shifted so the smallest becomes 0.
#[derive(Debug, Clone, Copy)]
pub struct WeightedRandomStrategy {
    window: usize,
}

impl WeightedRandomStrategy {
    /// Creates the strategy; a zero window is treated as 1.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    /// Selects using an explicit random source.
    pub fn select_with<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [Task],
        rng: &mut R,
    ) -> Option<&'a Task> {
        let window = candidates.get(..candidates.len().min(self.window))?;
        let lowest = window.iter().map(|task| task.priority().value()).min()?;
        let shift = i64::from(lowest.min(0));
        let weights = window.iter().map(|task| {
            let offset = i64::from(task.priority().value()) - shift;
            u64::try_from(offset.saturating_add(1))
                .ok()
                .and_then(|denominator| WEIGHT_SCALE.checked_div(denominator))
                .unwrap_or(0)
                .max(1)
        });
        WeightedIndex::new(weights).map_or_else(
            |_| window.first(),
            |index| window.get(index.sample(rng)),
        )
    }
}

impl Default for WeightedRandomStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHTED_WINDOW)
    }
}

impl ClaimStrategy for WeightedRandomStrategy {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    fn ordering(&self) -> CandidateOrder {
        CandidateOrder::PriorityFirst
    }

    fn window(&self) -> usize {
        self.window
    }

    fn select_candidate<'a>(&self, candidates: &'a [Task]) -> Option<&'a Task> {
        self.select_with(candidates, &mut rand::thread_rng())
    }
}

/// Default candidate window for [`WeightedRandomStrategy`].
pub const DEFAULT_WEIGHTED_WINDOW: usize = 16;

/// Fixed-point numerator for `1 / (p + 1)` weights.
const WEIGHT_SCALE: u64 = 1_000_000_000;

/// Strategy selector read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// [`FifoStrategy`].
    Fifo,
    /// [`LifoStrategy`].
    Lifo,
    /// [`PriorityStrategy`].
    #[default]
    Priority,
    /// [`WeightedRandomStrategy`].
    WeightedRandom,
}

impl StrategyKind {
    /// Builds the strategy. `window` only applies to weighted random.
    #[must_use]
    pub fn build(self, window: usize) -> Arc<dyn ClaimStrategy> {
        match self {
            Self::Fifo => Arc::new(FifoStrategy),
            Self::Lifo => Arc::new(LifoStrategy),
            Self::Priority => Arc::new(PriorityStrategy),
            Self::WeightedRandom => Arc::new(WeightedRandomStrategy::new(window)),
        }
    }

    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lifo => "lifo",
            Self::Priority => "priority",
            Self::WeightedRandom => "weighted_random",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unrecognised strategy name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown claim strategy: {0}")]
pub struct ParseStrategyError(pub String);

impl FromStr for StrategyKind {
    type Err = ParseStrategyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "priority" => Ok(Self::Priority),
            "weighted_random" | "weighted" => Ok(Self::WeightedRandom),
            _ => Err(ParseStrategyError(value.to_owned())),
        }
    }
}
