//! Command-style surface.
//!
//! Each [`Command`] runs against an [`Orchestrator`] and yields a [`CommandOutcome`]
//! whose status separates success from validation failures, conflicts, runtime
//! failures and integrity failures. A failed command leaves stored state unchanged.

use core::time::Duration;
use foreman_core::{
    BlockReason, ErrorClass, FeatureId, ForemanError, ImpactMatrix, ResourceKey, SnapshotHandle,
    TaskId, TaskSpec, TaskStatus, TouchSet,
};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{Orchestrator, Verdict};

/// Outcome category of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// The command took effect
    Success,
    /// Rejected at the boundary; nothing was stored
    ValidationFailed,
    /// Overlapping touch sets
    Conflict,
    /// The task ran but did not complete (worker failure, timeout, rejection)
    RuntimeFailure,
    /// History integrity could not be guaranteed; dispatching is halted
    IntegrityFailure,
    /// State could not be read or written
    IoFailure,
}

impl CommandStatus {
    /// Process exit code for this status
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::IoFailure => 1,
            Self::ValidationFailed => 2,
            Self::Conflict => 3,
            Self::RuntimeFailure => 4,
            Self::IntegrityFailure => 5,
        }
    }

    /// Whether the command took effect
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<ErrorClass> for CommandStatus {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Validation => Self::ValidationFailed,
            ErrorClass::Conflict => Self::Conflict,
            ErrorClass::Runtime => Self::RuntimeFailure,
            ErrorClass::Integrity => Self::IntegrityFailure,
            ErrorClass::Io => Self::IoFailure,
        }
    }
}

impl From<&BlockReason> for CommandStatus {
    fn from(reason: &BlockReason) -> Self {
        match reason {
            BlockReason::Conflict { .. } | BlockReason::UndeclaredResource { .. } => {
                Self::Conflict
            }
            BlockReason::SnapshotWriteFailure { .. } | BlockReason::HistoryWriteFailure { .. } => {
                Self::IntegrityFailure
            }
            BlockReason::WorkerFailed { .. }
            | BlockReason::Timeout { .. }
            | BlockReason::Rejected { .. }
            | BlockReason::UnmetDependency { .. }
            | BlockReason::Cancelled
            | BlockReason::Interrupted => Self::RuntimeFailure,
        }
    }
}

/// Result of running a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Outcome category
    pub status: CommandStatus,
    /// Human-readable summary
    pub message: String,
}

impl CommandOutcome {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            message: message.into(),
        }
    }

    fn failure(status: CommandStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ForemanError> for CommandOutcome {
    fn from(error: ForemanError) -> Self {
        Self::failure(error.class().into(), error.to_string())
    }
}

/// A request against the coordinator
#[derive(Debug, Clone)]
pub enum Command {
    /// `feature <description>`
    Feature {
        /// Feature description
        description: String,
    },
    /// `prd <feature_id>`
    Prd {
        /// Feature receiving the PRD
        feature: FeatureId,
        /// PRD title
        title: String,
        /// PRD body
        body: String,
    },
    /// `tasks <feature_id>`
    Tasks {
        /// Owning feature
        feature: FeatureId,
        /// Tasks to create, all or nothing
        specs: Vec<TaskSpec>,
    },
    /// Add a dependency edge
    Depend {
        /// Dependent task
        task: TaskId,
        /// Task it waits for
        dependency: TaskId,
    },
    /// `plan <task_id>`
    Plan {
        /// Task to plan
        task: TaskId,
        /// Planned change per resource
        impact_matrix: ImpactMatrix,
        /// Risk notes supplied by the planner
        notes: Vec<String>,
    },
    /// `code <task_id>`
    Code {
        /// Task to schedule
        task: TaskId,
        /// Deadline overriding the configured default
        deadline: Option<Duration>,
    },
    /// Record a validation verdict
    Verdict {
        /// Validated task
        task: TaskId,
        /// The verdict
        verdict: Verdict,
    },
    /// Replace a task's touch set
    Revise {
        /// Task to revise
        task: TaskId,
        /// New touch set
        touch_set: TouchSet,
    },
    /// Cancel a feature
    Cancel {
        /// Feature to cancel
        feature: FeatureId,
    },
    /// Archive a feature
    Archive {
        /// Feature to archive
        feature: FeatureId,
    },
    /// Snapshot a resource by hand
    Snapshot {
        /// Resource to capture
        key: ResourceKey,
        /// Why it was captured
        reason: String,
    },
    /// Restore a snapshot
    Revert {
        /// Snapshot to restore
        handle: SnapshotHandle,
    },
    /// Clear a halt
    Resume,
}

impl Command {
    /// Run the command.
    pub async fn run(self, orchestrator: &mut Orchestrator) -> CommandOutcome {
        match self.dispatch(orchestrator).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!("Command failed: {error}");
                error.into()
            }
        }
    }

    async fn dispatch(self, orchestrator: &mut Orchestrator) -> foreman_core::Result<CommandOutcome> {
        let outcome = match self {
            Self::Feature { description } => {
                let id = orchestrator.create_feature(description);
                CommandOutcome::success(format!("Created feature {id}"))
            }
            Self::Prd {
                feature,
                title,
                body,
            } => {
                let prd = orchestrator.attach_prd(feature, title, body)?;
                CommandOutcome::success(format!("Attached {prd} to {feature}"))
            }
            Self::Tasks { feature, specs } => {
                let ids = orchestrator.create_tasks(feature, specs)?;
                let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
                CommandOutcome::success(format!(
                    "Created {} task(s) under {feature}: {}",
                    ids.len(),
                    names.join(", ")
                ))
            }
            Self::Depend { task, dependency } => {
                orchestrator.add_dependency(&task, &dependency)?;
                CommandOutcome::success(format!("{task} now depends on {dependency}"))
            }
            Self::Plan {
                task,
                impact_matrix,
                notes,
            } => {
                let plan = orchestrator.plan(&task, impact_matrix, notes)?;
                let mut message = format!(
                    "Planned {task}: {} resource(s)",
                    plan.impact_matrix.len()
                );
                for note in &plan.duplicate_risk_notes {
                    message.push_str("\n  risk: ");
                    message.push_str(note);
                }
                CommandOutcome::success(message)
            }
            Self::Code { task, deadline } => {
                orchestrator.request_code(&task, deadline)?;
                orchestrator.run_until_idle().await?;
                code_outcome(orchestrator, &task)?
            }
            Self::Verdict { task, verdict } => {
                let status = orchestrator.record_verdict(&task, verdict)?;
                CommandOutcome::success(format!("{task} is {status}"))
            }
            Self::Revise { task, touch_set } => {
                match orchestrator.revise_touch_set(&task, touch_set)? {
                    Some(exclusion) => CommandOutcome::failure(
                        CommandStatus::Conflict,
                        format!("{task} blocked: {}", exclusion.reason()),
                    ),
                    None => CommandOutcome::success(format!("Revised touch set of {task}")),
                }
            }
            Self::Cancel { feature } => {
                let blocked = orchestrator.cancel_feature(feature)?;
                CommandOutcome::success(format!(
                    "Cancelled {feature}; {} task(s) blocked",
                    blocked.len()
                ))
            }
            Self::Archive { feature } => {
                orchestrator.archive_feature(feature)?;
                CommandOutcome::success(format!("Archived {feature}"))
            }
            Self::Snapshot { key, reason } => {
                let handle = orchestrator.snapshot(&key, reason).await?;
                CommandOutcome::success(format!("Snapshot {handle}"))
            }
            Self::Revert { handle } => {
                let entry = orchestrator.revert_to(&handle).await?;
                CommandOutcome::success(format!(
                    "Reverted to {handle} (changelog #{})",
                    entry.sequence
                ))
            }
            Self::Resume => {
                if orchestrator.resume() {
                    CommandOutcome::success("Dispatching resumed")
                } else {
                    CommandOutcome::success("Not halted")
                }
            }
        };
        Ok(outcome)
    }
}

/// Describe where a task ended up after a `code` run.
fn code_outcome(orchestrator: &Orchestrator, id: &TaskId) -> foreman_core::Result<CommandOutcome> {
    let task = orchestrator.store().task(id)?;
    let outcome = match (task.status, &task.blocked_reason) {
        (TaskStatus::Blocked, Some(reason)) => {
            CommandOutcome::failure(reason.into(), format!("{id} blocked: {reason}"))
        }
        (TaskStatus::Planned, _) => {
            let waiting: Vec<&str> = orchestrator
                .store()
                .graph()
                .dependencies(id)
                .into_iter()
                .filter(|dependency| {
                    orchestrator
                        .store()
                        .status(dependency)
                        .is_ok_and(|status| status != TaskStatus::Done)
                })
                .map(TaskId::as_str)
                .collect();
            CommandOutcome::success(format!(
                "{id} queued; waiting on {}",
                waiting.join(", ")
            ))
        }
        (status, _) => CommandOutcome::success(format!("{id} is {status}")),
    };
    Ok(outcome)
}
