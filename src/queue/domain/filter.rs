//! Listing filters.

use super::{TagSet, Task, TaskStatus, TaskType};

/// Default page size when a filter sets no limit.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Criteria for listing tasks. Results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    status: Option<TaskStatus>,
    task_type: Option<TaskType>,
    tags: TagSet,
    limit: Option<u32>,
    offset: u32,
}

impl TaskFilter {
    /// Creates a filter matching every task.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one status.
    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to one task type.
    #[must_use]
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Restricts to tasks whose compatibility includes all of `tags`.
    #[must_use]
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the number of matching tasks to skip.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Returns the status restriction.
    #[must_use]
    pub const fn status(&self) -> Option<TaskStatus> {
        self.status
    }

    /// Returns the type restriction.
    #[must_use]
    pub const fn task_type(&self) -> Option<&TaskType> {
        self.task_type.as_ref()
    }

    /// Returns the required tags.
    #[must_use]
    pub const fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Returns the effective page size.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }

    /// Returns the offset.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns whether `task` satisfies every criterion except paging.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|status| task.status() == status)
            && self
                .task_type
                .as_ref()
                .is_none_or(|task_type| task.task_type() == task_type)
            && self.tags.is_satisfied_by(task.compatibility())
    }
}
