//! Shared fixtures for queue unit tests.

use crate::queue::domain::{NewTask, Priority, Task, TaskId, TaskType};
use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use mockable::Clock;
use std::sync::Mutex;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

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

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// Builds a queued task with the given id, priority and creation offset in
/// seconds from [`epoch`].
pub fn queued_task(id: i64, priority: i32, created_offset_secs: i64) -> Task {
    let created = epoch() + TimeDelta::seconds(created_offset_secs);
    NewTask::new(
        TaskType::new("email").expect("valid task type"),
        b"payload".to_vec(),
        3,
        created,
    )
    .expect("valid new task")
    .with_priority(Priority::new(priority))
    .into_task(TaskId::new(id))
}
