//! Compatibility tags attached to tasks and capability tags declared by
//! workers.

use super::TaskDomainError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single `key=value` tag such as `region=eu` or `gpu=true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Creates a tag from separate key and value parts.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTag`] when either part is empty,
    /// contains whitespace, or the key contains `=`.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, TaskDomainError> {
        let key = key.into();
        let value = value.into();
        let part_ok = |part: &str| !part.is_empty() && !part.chars().any(char::is_whitespace);
        if !part_ok(&key) || !part_ok(&value) || key.contains('=') {
            return Err(TaskDomainError::InvalidTag(format!("{key}={value}")));
        }
        Ok(Self { key, value })
    }

    /// Parses a tag from its `key=value` form.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTag`] when the input lacks `=` or
    /// either side is invalid.
    pub fn parse(raw: &str) -> Result<Self, TaskDomainError> {
        let (key, value) = raw
            .trim()
            .split_once('=')
            .ok_or_else(|| TaskDomainError::InvalidTag(raw.to_owned()))?;
        Self::new(key, value)
    }

    /// Returns the tag key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the tag value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl TryFrom<String> for Tag {
    type Error = TaskDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

/// Ordered, duplicate-free set of tags.
///
/// On a task it lists requirements; on a worker it lists what the worker
/// can serve. A worker may claim a task when the task's set is a subset of
/// the worker's set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    /// Creates an empty tag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses every `key=value` string into a tag set.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTag`] for the first malformed entry.
    pub fn parse<I, S>(raw: I) -> Result<Self, TaskDomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .map(|entry| Tag::parse(entry.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Adds a tag, returning the updated set.
    #[must_use]
    pub fn with(mut self, tag: Tag) -> Self {
        self.0.insert(tag);
        self
    }

    /// Returns whether every tag in `self` is also present in `other`.
    #[must_use]
    pub fn is_satisfied_by(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Returns whether the set holds no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates the tags in order.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// Returns the tags rendered as `key=value` strings.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<T: IntoIterator<Item = Tag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strings().join(","))
    }
}
