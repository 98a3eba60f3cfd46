//! Shared clock and service wiring for integration tests.

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use leasehold::config::LeaseConfig;
use leasehold::queue::domain::{BackoffPolicy, WorkerId};
use leasehold::queue::ports::QueueRepository;
use leasehold::queue::services::{LeaseManager, QueueService};
use leasehold::queue::strategy::StrategyKind;
use mockable::Clock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Clock that only moves when a test advances it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(epoch()),
        }
    }
}

impl ManualClock {
    /// Creates a clock reading [`epoch`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Fixed starting instant for every test clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// Backoff without jitter: 1s, doubling, capped at 30s.
pub fn fixed_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), 2, Duration::from_secs(30)).without_jitter()
}

/// Validated worker identifier.
pub fn worker(name: &str) -> WorkerId {
    WorkerId::new(name).expect("valid worker id")
}

/// Services sharing one store and one manual clock.
pub struct Services<R: QueueRepository> {
    /// Store shared by the services.
    pub repository: Arc<R>,
    /// Manual clock shared by the services.
    pub clock: Arc<ManualClock>,
    /// Producer and operator surface.
    pub queue: QueueService<R, ManualClock>,
    /// Worker surface.
    pub leases: Arc<LeaseManager<R, ManualClock>>,
}

impl<R: QueueRepository> Services<R> {
    /// Wires the services over `repository` with the given claim strategy.
    pub fn new(repository: R, strategy: StrategyKind, lease: LeaseConfig) -> Self {
        let shared = Arc::new(repository);
        let clock = Arc::new(ManualClock::new());
        let queue = QueueService::new(Arc::clone(&shared), Arc::clone(&clock));
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&shared),
            Arc::clone(&clock),
            strategy.build(4),
            lease,
            fixed_backoff(),
        ));
        Self {
            repository: shared,
            clock,
            queue,
            leases,
        }
    }
}
