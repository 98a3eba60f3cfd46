//! Enqueue-time validation rules.

use super::{Priority, TaskDomainError, TaskType};
use std::collections::BTreeSet;

/// Known task types and accepted priority range.
///
/// An empty set of types accepts any well-formed type. The registry is
/// built once at startup and passed to the services that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTypeRegistry {
    types: BTreeSet<TaskType>,
    priority_min: i32,
    priority_max: i32,
    default_max_attempts: u32,
}

impl Default for TaskTypeRegistry {
    fn default() -> Self {
        Self {
            types: BTreeSet::new(),
            priority_min: 0,
            priority_max: 1000,
            default_max_attempts: 5,
        }
    }
}

impl TaskTypeRegistry {
    /// Creates a registry that accepts any well-formed type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type. Once any type is registered, unregistered
    /// types are rejected.
    #[must_use]
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.types.insert(task_type);
        self
    }

    /// Sets the inclusive priority range; the bounds are swapped if reversed.
    #[must_use]
    pub const fn with_priority_range(mut self, min: i32, max: i32) -> Self {
        if min <= max {
            self.priority_min = min;
            self.priority_max = max;
        } else {
            self.priority_min = max;
            self.priority_max = min;
        }
        self
    }

    /// Sets the attempt budget used when a request does not specify one.
    #[must_use]
    pub const fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Returns the attempt budget used when a request does not specify one.
    #[must_use]
    pub const fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    /// Returns the registered types.
    pub fn types(&self) -> impl Iterator<Item = &TaskType> {
        self.types.iter()
    }

    /// Checks that `task_type` may be enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::UnknownTaskType`] when types are registered
    /// and `task_type` is not among them.
    pub fn check_type(&self, task_type: &TaskType) -> Result<(), TaskDomainError> {
        if self.types.is_empty() || self.types.contains(task_type) {
            return Ok(());
        }
        Err(TaskDomainError::UnknownTaskType(task_type.clone()))
    }

    /// Checks that `priority` lies in the accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::PriorityOutOfRange`] otherwise.
    pub const fn check_priority(&self, priority: Priority) -> Result<(), TaskDomainError> {
        let value = priority.value();
        if value < self.priority_min || value > self.priority_max {
            return Err(TaskDomainError::PriorityOutOfRange {
                priority: value,
                min: self.priority_min,
                max: self.priority_max,
            });
        }
        Ok(())
    }
}
