//! Claim strategy selection tests.

use super::support::queued_task;
use crate::queue::domain::{Task, TaskId};
use crate::queue::strategy::{
    CandidateOrder, ClaimStrategy, FifoStrategy, LifoStrategy, PriorityStrategy, StrategyKind,
    WeightedRandomStrategy,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest::{fixture, rstest};

/// Tasks `(id, priority, created offset)`: the oldest has the worst priority.
#[fixture]
fn candidates() -> Vec<Task> {
    vec![
        queued_task(1, 5, 0),
        queued_task(2, 1, 10),
        queued_task(3, 3, 20),
        queued_task(4, 1, 5),
    ]
}

fn ordered(strategy: &dyn ClaimStrategy, mut tasks: Vec<Task>) -> Vec<Task> {
    let order = strategy.ordering();
    tasks.sort_by(|left, right| order.compare(left, right));
    tasks
}

fn ids(tasks: &[Task]) -> Vec<i64> {
    tasks.iter().map(|task| task.id().value()).collect()
}

#[rstest]
fn fifo_orders_oldest_first(candidates: Vec<Task>) {
    let tasks = ordered(&FifoStrategy, candidates);
    assert_eq!(ids(&tasks), vec![1, 4, 2, 3]);
    assert_eq!(
        FifoStrategy.select_candidate(&tasks).map(Task::id),
        Some(TaskId::new(1))
    );
}

#[rstest]
fn lifo_orders_newest_first(candidates: Vec<Task>) {
    let tasks = ordered(&LifoStrategy, candidates);
    assert_eq!(ids(&tasks), vec![3, 2, 4, 1]);
    assert_eq!(
        LifoStrategy.select_candidate(&tasks).map(Task::id),
        Some(TaskId::new(3))
    );
}

#[rstest]
fn priority_breaks_ties_by_age(candidates: Vec<Task>) {
    let tasks = ordered(&PriorityStrategy, candidates);
    assert_eq!(ids(&tasks), vec![4, 2, 3, 1]);
}

#[rstest]
fn ties_on_creation_time_fall_back_to_id() {
    let first = queued_task(10, 0, 0);
    let second = queued_task(11, 0, 0);
    assert!(CandidateOrder::OldestFirst.compare(&first, &second).is_lt());
    assert!(CandidateOrder::NewestFirst.compare(&first, &second).is_gt());
}

#[rstest]
#[case(StrategyKind::Fifo)]
#[case(StrategyKind::Lifo)]
#[case(StrategyKind::Priority)]
fn deterministic_strategies_fetch_a_single_candidate(#[case] kind: StrategyKind) {
    let strategy = kind.build(8);
    assert_eq!(strategy.window(), 1);
    assert!(strategy.select_candidate(&[]).is_none());
}

#[rstest]
fn weighted_random_only_picks_inside_its_window(candidates: Vec<Task>) {
    let strategy = WeightedRandomStrategy::new(2);
    let tasks = ordered(&strategy, candidates);
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..100 {
        let picked = strategy
            .select_with(&tasks, &mut rng)
            .map(|task| task.id().value());
        assert!(matches!(picked, Some(4 | 2)), "picked {picked:?}");
    }
}

#[rstest]
fn weighted_random_favours_lower_priority_values() {
    let tasks = vec![queued_task(1, 0, 0), queued_task(2, 999, 0)];
    let strategy = WeightedRandomStrategy::new(16);
    let mut rng = StdRng::seed_from_u64(1);

    let urgent = (0..500)
        .filter(|_| {
            strategy
                .select_with(&tasks, &mut rng)
                .is_some_and(|task| task.id() == TaskId::new(1))
        })
        .count();

    assert!(urgent > 450, "urgent task chosen {urgent} times");
}

#[rstest]
fn weighted_random_handles_negative_priorities() {
    let tasks = vec![queued_task(1, -10, 0), queued_task(2, -3, 0)];
    let strategy = WeightedRandomStrategy::new(4);
    let mut rng = StdRng::seed_from_u64(3);

    assert!(strategy.select_with(&tasks, &mut rng).is_some());
    assert!(strategy.select_with(&[], &mut rng).is_none());
}

#[rstest]
#[case("fifo", StrategyKind::Fifo)]
#[case("LIFO", StrategyKind::Lifo)]
#[case("priority", StrategyKind::Priority)]
#[case("weighted-random", StrategyKind::WeightedRandom)]
fn strategy_kind_parses_configuration_names(#[case] raw: &str, #[case] kind: StrategyKind) {
    assert_eq!(raw.parse::<StrategyKind>(), Ok(kind));
    assert_eq!(kind.build(8).name(), kind.as_str());
}

#[rstest]
fn unknown_strategy_names_are_rejected() {
    assert!("random".parse::<StrategyKind>().is_err());
}
