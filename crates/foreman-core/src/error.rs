//! Error types for feature and task coordination.

use core::result::Result as CoreResult;
use std::io::Error as IoError;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::conflict::ConflictReport;
use crate::history::SnapshotHandle;
use crate::task::{FeatureId, ResourceKey, TaskId, TaskStatus};

/// Result type for coordination operations.
pub type Result<T> = CoreResult<T, ForemanError>;

/// Broad category of an error, used to pick a command status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Structural violation rejected at the boundary; nothing was persisted
    Validation,
    /// Overlapping touch sets; recoverable by serialization or replanning
    Conflict,
    /// Runtime condition recorded as task state (timeouts)
    Runtime,
    /// History integrity could not be guaranteed
    Integrity,
    /// Storage or serialization failure
    Io,
}

/// Errors that can occur while coordinating features and tasks.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Adding a dependency edge would create a cycle
    #[error("Cycle detected: {task} cannot depend on {dependency}")]
    CycleDetected {
        /// Task that would gain the dependency
        task: TaskId,
        /// Dependency that already (transitively) depends on `task`
        dependency: TaskId,
    },

    /// Too many acceptance criteria
    #[error("Task {task} has {count} acceptance criteria, the limit is {limit}")]
    AcceptanceCriteriaLimitExceeded {
        /// Rejected task
        task: TaskId,
        /// Number of criteria requested
        count: usize,
        /// Maximum allowed
        limit: usize,
    },

    /// Overlapping touch sets
    #[error("Conflict detected: {0}")]
    ConflictDetected(ConflictReport),

    /// Requested status change is not an edge of the state machine
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose status was to change
        task: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// A dispatched task exceeded its deadline
    #[error("Task {task} timed out after {after_ms}ms")]
    Timeout {
        /// Task that timed out
        task: TaskId,
        /// Deadline in milliseconds
        after_ms: u64,
    },

    /// A pre-mutation snapshot could not be persisted
    #[error("Snapshot write failed for {resource}: {reason}")]
    SnapshotWriteFailure {
        /// Resource that was about to change
        resource: ResourceKey,
        /// Underlying failure
        reason: String,
    },

    /// No feature with this id
    #[error("Unknown feature: {0}")]
    UnknownFeature(FeatureId),

    /// No task with this id
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// A dependency names a task that does not exist
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// Task declaring the dependency
        task: TaskId,
        /// Missing dependency
        dependency: TaskId,
    },

    /// A task with this id already exists
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// No snapshot with this handle
    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(SnapshotHandle),

    /// A worker changed resources outside its declared touch set
    #[error("Task {task} changed undeclared resources: {keys:?}")]
    UndeclaredResource {
        /// Offending task
        task: TaskId,
        /// Keys outside the touch set
        keys: Vec<ResourceKey>,
    },

    /// Undoing a partially applied commit failed; the named resources stay changed
    #[error("Rollback incomplete: {0}")]
    IncompleteRollback(String),

    /// Dispatching is halted after a history-integrity failure
    #[error("Dispatching halted: {0}")]
    Halted(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl ForemanError {
    /// Category used by the command surface to pick a status code.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CycleDetected { .. }
            | Self::AcceptanceCriteriaLimitExceeded { .. }
            | Self::InvalidTransition { .. }
            | Self::UnknownFeature(_)
            | Self::UnknownTask(_)
            | Self::UnknownDependency { .. }
            | Self::DuplicateTask(_)
            | Self::UnknownSnapshot(_)
            | Self::Config(_)
            | Self::Other(_) => ErrorClass::Validation,
            Self::ConflictDetected(_) | Self::UndeclaredResource { .. } => ErrorClass::Conflict,
            Self::Timeout { .. } => ErrorClass::Runtime,
            Self::SnapshotWriteFailure { .. } | Self::IncompleteRollback(_) | Self::Halted(_) => {
                ErrorClass::Integrity
            }
            Self::Io(_) | Self::Json(_) | Self::Toml(_) => ErrorClass::Io,
        }
    }

    /// Whether this error must stop all forward progress.
    pub fn blocks_progress(&self) -> bool {
        self.class() == ErrorClass::Integrity
    }
}
