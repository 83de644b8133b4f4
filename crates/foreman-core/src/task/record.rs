//! Core task types and the task status state machine

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::feature::FeatureId;
use crate::error::ForemanError;

/// Maximum number of acceptance criteria a task may carry.
pub const MAX_ACCEPTANCE_CRITERIA: usize = 5;

/// Caller-supplied task identifier (e.g. `T1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a resource a task may modify (usually a workspace-relative file path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Creates a resource key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Set of resources a task declares it will modify.
pub type TouchSet = BTreeSet<ResourceKey>;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created, waiting for an approved PRD
    Draft,
    /// Feature PRD approved
    #[serde(rename = "PRDApproved")]
    PrdApproved,
    /// Has a current implementation plan
    Planned,
    /// Dispatched to a worker
    InProgress,
    /// Worker output applied to the workspace
    Implemented,
    /// Accepted by an external validation verdict
    Validated,
    /// Terminal
    Done,
    /// Halted by failure, timeout, conflict or cancellation
    Blocked,
}

impl TaskStatus {
    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// Forward edges advance one step along the pipeline. The only regressions are
    /// `Planned -> Draft` and `Blocked -> Planned`; any non-terminal status may block.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::PrdApproved)
                | (Self::PrdApproved | Self::Blocked, Self::Planned)
                | (Self::Planned, Self::InProgress | Self::Draft)
                | (Self::InProgress, Self::Implemented)
                | (Self::Implemented, Self::Validated)
                | (Self::Validated, Self::Done)
                | (
                    Self::Draft
                        | Self::PrdApproved
                        | Self::Planned
                        | Self::InProgress
                        | Self::Implemented
                        | Self::Validated,
                    Self::Blocked
                )
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }

    /// Returns the string used in persisted state and command output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::PrdApproved => "PRDApproved",
            Self::Planned => "Planned",
            Self::InProgress => "InProgress",
            Self::Implemented => "Implemented",
            Self::Validated => "Validated",
            Self::Done => "Done",
            Self::Blocked => "Blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ForemanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Draft" => Ok(Self::Draft),
            "PRDApproved" => Ok(Self::PrdApproved),
            "Planned" => Ok(Self::Planned),
            "InProgress" => Ok(Self::InProgress),
            "Implemented" => Ok(Self::Implemented),
            "Validated" => Ok(Self::Validated),
            "Done" => Ok(Self::Done),
            "Blocked" => Ok(Self::Blocked),
            other => Err(ForemanError::Other(format!("unknown task status: {other}"))),
        }
    }
}

/// Why a task was moved to [`TaskStatus::Blocked`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The worker reported a failure
    WorkerFailed {
        /// Failure message reported by the worker
        message: String,
    },
    /// The per-task deadline elapsed
    Timeout {
        /// Deadline that was exceeded, in milliseconds
        after_ms: u64,
    },
    /// The touch set overlaps a running task
    Conflict {
        /// Running tasks holding the overlapping keys
        with: BTreeSet<TaskId>,
        /// Overlapping keys
        keys: BTreeSet<ResourceKey>,
    },
    /// The worker changed resources outside the declared touch set
    UndeclaredResource {
        /// Keys that were not declared
        keys: BTreeSet<ResourceKey>,
    },
    /// A pre-mutation snapshot could not be written
    SnapshotWriteFailure {
        /// Underlying failure
        message: String,
    },
    /// The changelog entry for the task's changes could not be written
    HistoryWriteFailure {
        /// Underlying failure
        message: String,
    },
    /// The external validator rejected the implementation
    Rejected {
        /// Rejection reason supplied with the verdict
        reason: String,
    },
    /// A dependency that is not yet `Done` was added while the task was running
    UnmetDependency {
        /// The new dependency
        dependency: TaskId,
    },
    /// The owning feature was cancelled
    Cancelled,
    /// The task was in progress when the previous run ended
    Interrupted,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerFailed { message } => write!(formatter, "worker failed: {message}"),
            Self::Timeout { after_ms } => write!(formatter, "timeout after {after_ms}ms"),
            Self::Conflict { with, .. } => {
                let holders: Vec<&str> = with.iter().map(TaskId::as_str).collect();
                write!(formatter, "conflicts with {}", holders.join(", "))
            }
            Self::UndeclaredResource { keys } => {
                let names: Vec<&str> = keys.iter().map(ResourceKey::as_str).collect();
                write!(formatter, "changed undeclared resources: {}", names.join(", "))
            }
            Self::SnapshotWriteFailure { message } => {
                write!(formatter, "snapshot write failure: {message}")
            }
            Self::HistoryWriteFailure { message } => {
                write!(formatter, "changelog write failure: {message}")
            }
            Self::Rejected { reason } => write!(formatter, "rejected: {reason}"),
            Self::UnmetDependency { dependency } => write!(formatter, "waiting on {dependency}"),
            Self::Cancelled => formatter.write_str("feature cancelled"),
            Self::Interrupted => formatter.write_str("interrupted"),
        }
    }
}

/// Task creation request, as handed over by the task-generating role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Requested task id
    pub id: TaskId,
    /// What the task should accomplish
    pub description: String,
    /// Acceptance criteria, at most [`MAX_ACCEPTANCE_CRITERIA`]
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Tasks that must be `Done` before this one may run
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Resources this task will modify
    #[serde(default)]
    pub touch_set: TouchSet,
}

impl TaskSpec {
    /// Creates a spec with no criteria, dependencies or touched resources.
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            dependencies: BTreeSet::new(),
            touch_set: TouchSet::new(),
        }
    }

    /// Sets the acceptance criteria.
    #[must_use]
    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the touch set.
    #[must_use]
    pub fn with_touch_set<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceKey>,
    {
        self.touch_set = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the acceptance-criteria cap.
    ///
    /// # Errors
    /// Returns `AcceptanceCriteriaLimitExceeded` when more than
    /// [`MAX_ACCEPTANCE_CRITERIA`] criteria are given.
    pub fn validate(&self) -> Result<(), ForemanError> {
        if self.acceptance_criteria.len() > MAX_ACCEPTANCE_CRITERIA {
            return Err(ForemanError::AcceptanceCriteriaLimitExceeded {
                task: self.id.clone(),
                count: self.acceptance_criteria.len(),
                limit: MAX_ACCEPTANCE_CRITERIA,
            });
        }
        Ok(())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A schedulable unit of work. Owned by the feature store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Owning feature
    pub feature_id: FeatureId,
    /// What the task should accomplish
    pub description: String,
    /// Acceptance criteria (never more than [`MAX_ACCEPTANCE_CRITERIA`])
    acceptance_criteria: Vec<String>,
    /// Tasks that must be `Done` first
    pub dependencies: BTreeSet<TaskId>,
    /// Resources this task will modify
    pub touch_set: TouchSet,
    /// Current status
    pub status: TaskStatus,
    /// Worker currently executing the task
    pub assigned_worker: Option<String>,
    /// Reason for the most recent block, cleared on replanning
    #[serde(default)]
    pub blocked_reason: Option<BlockReason>,
}

impl Task {
    /// Builds a `Draft` task from a validated spec.
    ///
    /// # Errors
    /// Returns `AcceptanceCriteriaLimitExceeded` when the spec breaks the cap.
    pub fn from_spec(feature_id: FeatureId, spec: TaskSpec) -> Result<Self, ForemanError> {
        spec.validate()?;
        Ok(Self {
            id: spec.id,
            feature_id,
            description: spec.description,
            acceptance_criteria: spec.acceptance_criteria,
            dependencies: spec.dependencies,
            touch_set: spec.touch_set,
            status: TaskStatus::Draft,
            assigned_worker: None,
            blocked_reason: None,
        })
    }

    /// Acceptance criteria in declaration order.
    pub fn acceptance_criteria(&self) -> &[String] {
        &self.acceptance_criteria
    }

    /// Whether this task's touch set shares any key with `other`.
    pub fn overlaps(&self, other: &TouchSet) -> bool {
        !self.touch_set.is_disjoint(other)
    }
}
