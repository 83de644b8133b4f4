//! Changelog entries and legacy snapshots.
//!
//! Both record types are immutable once written: the stores that hold them only
//! ever append.

use chrono::{DateTime, Utc};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ForemanError;
use crate::task::{Content, ResourceKey, TaskId};

/// Kind of change recorded in the changelog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// New functionality
    #[default]
    Feature,
    /// Bug fix
    Fix,
    /// Behaviour-preserving restructuring
    Refactor,
    /// Formatting or visual style
    Style,
    /// Documentation
    Docs,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Feature => "feature",
            Self::Fix => "fix",
            Self::Refactor => "refactor",
            Self::Style => "style",
            Self::Docs => "docs",
        };
        formatter.write_str(label)
    }
}

impl FromStr for ChangeType {
    type Err = ForemanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "feature" => Ok(Self::Feature),
            "fix" => Ok(Self::Fix),
            "refactor" => Ok(Self::Refactor),
            "style" => Ok(Self::Style),
            "docs" => Ok(Self::Docs),
            other => Err(ForemanError::Other(format!("unknown change type: {other}"))),
        }
    }
}

/// One applied change. Never edited after it is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Position in the log, assigned on append
    pub sequence: u64,
    /// Append time, strictly increasing across the log
    pub timestamp: DateTime<Utc>,
    /// Kind of change
    pub change_type: ChangeType,
    /// Resources the change touched
    pub resource_keys: BTreeSet<ResourceKey>,
    /// Free-text description
    pub description: String,
    /// Roles that contributed to the change
    pub agent_roles: BTreeSet<String>,
    /// Task whose completion produced the change, if any
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// Changelog entry before the log assigns its position and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Kind of change
    pub change_type: ChangeType,
    /// Resources the change touched
    pub resource_keys: BTreeSet<ResourceKey>,
    /// Free-text description
    pub description: String,
    /// Roles that contributed to the change
    pub agent_roles: BTreeSet<String>,
    /// Originating task
    pub task_id: Option<TaskId>,
}

impl ChangeRecord {
    /// Creates a record with no roles and no originating task.
    pub fn new(change_type: ChangeType, description: impl Into<String>) -> Self {
        Self {
            change_type,
            resource_keys: BTreeSet::new(),
            description: description.into(),
            agent_roles: BTreeSet::new(),
            task_id: None,
        }
    }

    /// Sets the touched resources.
    #[must_use]
    pub fn with_resources(mut self, keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        self.resource_keys = keys.into_iter().collect();
        self
    }

    /// Sets the contributing roles.
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.agent_roles = roles.into_iter().collect();
        self
    }

    /// Sets the originating task.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Handle returned by a snapshot, used to revert to it later
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHandle(String);

impl SnapshotHandle {
    /// Builds the handle for a snapshot of `key` taken at `timestamp`.
    ///
    /// The handle doubles as the snapshot's file stem, so the key is reduced to
    /// characters that are safe in file names.
    pub fn for_snapshot(timestamp: DateTime<Utc>, key: &ResourceKey) -> Self {
        let sanitized: String = key
            .as_str()
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                    character
                } else {
                    '_'
                }
            })
            .collect();
        Self(format!(
            "{}_{sanitized}",
            timestamp.format("%Y%m%dT%H%M%S%.6fZ")
        ))
    }

    /// Returns the handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for SnapshotHandle {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Machine-followable procedure that undoes an overwrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RevertProcedure {
    /// Write the captured content back to the resource
    RestoreContent,
    /// The resource did not exist before; remove it
    DeleteResource,
}

impl fmt::Display for RevertProcedure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreContent => formatter.write_str("restore the captured prior content"),
            Self::DeleteResource => formatter.write_str("delete the resource"),
        }
    }
}

/// Prior state of a resource, captured before it was overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySnapshot {
    /// Handle naming this snapshot
    pub handle: SnapshotHandle,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Resource that was about to change
    pub resource_key: ResourceKey,
    /// Content before the change, `None` when the resource did not exist
    pub prior_content: Option<Content>,
    /// Why the resource was about to change
    pub reason: String,
    /// How to undo the change
    pub revert_procedure: RevertProcedure,
}

impl LegacySnapshot {
    /// Captures `prior_content` of `resource_key`.
    pub fn capture(
        timestamp: DateTime<Utc>,
        resource_key: ResourceKey,
        prior_content: Option<Content>,
        reason: String,
    ) -> Self {
        let revert_procedure = if prior_content.is_some() {
            RevertProcedure::RestoreContent
        } else {
            RevertProcedure::DeleteResource
        };
        Self {
            handle: SnapshotHandle::for_snapshot(timestamp, &resource_key),
            timestamp,
            resource_key,
            prior_content,
            reason,
            revert_procedure,
        }
    }
}
