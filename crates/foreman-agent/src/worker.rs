//! Worker seam: what a dispatched task hands to a worker and what it expects back.
//!
//! Workers never touch the feature store, the history log or the workspace. They
//! receive an owned [`WorkAssignment`] and answer with a [`WorkOutput`]; the
//! coordinator applies the output.

use async_trait::async_trait;
use core::future::pending;
use foreman_core::{
    ChangeType, Content, FeatureId, ForemanError, Plan, ResourceChange, ResourceKey, Result, Task, TaskId,
    TouchSet,
};
use serde::{Deserialize, Serialize};
use serde_json::{from_slice, to_vec};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use tokio::sync::watch;

/// Everything a worker needs to carry out one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Task being executed
    pub task_id: TaskId,
    /// Owning feature
    pub feature_id: FeatureId,
    /// What the task should accomplish
    pub description: String,
    /// Acceptance criteria
    pub acceptance_criteria: Vec<String>,
    /// Resources the worker may change
    pub touch_set: TouchSet,
    /// Current plan, if any
    pub plan: Option<Plan>,
    /// Content of each touched resource at dispatch time (`None` if absent)
    pub resources: BTreeMap<ResourceKey, Option<Content>>,
}

impl WorkAssignment {
    /// Build an assignment from a task, its plan and the captured resource contents.
    pub fn new(
        task: &Task,
        plan: Option<Plan>,
        resources: BTreeMap<ResourceKey, Option<Content>>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            feature_id: task.feature_id,
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria().to_vec(),
            touch_set: task.touch_set.clone(),
            plan,
            resources,
        }
    }
}

/// What a worker reports back on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkOutput {
    /// Changes to apply, in order
    #[serde(default)]
    pub changes: Vec<ResourceChange>,
    /// Changelog category
    #[serde(default)]
    pub change_type: ChangeType,
    /// Changelog description; the task description is used when empty
    #[serde(default)]
    pub summary: String,
    /// Roles that contributed; the configured defaults are used when empty
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl WorkOutput {
    /// Output applying `changes` as a feature change.
    pub fn with_changes(changes: Vec<ResourceChange>) -> Self {
        Self {
            changes,
            change_type: ChangeType::Feature,
            summary: String::new(),
            roles: BTreeSet::new(),
        }
    }

    /// Keys changed outside `touch_set`.
    pub fn undeclared_keys(&self, touch_set: &TouchSet) -> Vec<ResourceKey> {
        let undeclared: BTreeSet<&ResourceKey> = self
            .changes
            .iter()
            .map(ResourceChange::key)
            .filter(|key| !touch_set.contains(*key))
            .collect();
        undeclared.into_iter().cloned().collect()
    }
}

/// Cooperative cancellation signal handed to each worker.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a linked sender/signal pair.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (sender, receiver) = watch::channel(false);
        (sender, Self { receiver })
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the coordinator
    /// dropped the sender without cancelling.
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            pending::<()>().await;
        }
    }
}

/// Executes assigned tasks
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Name recorded as the task's assigned worker
    fn name(&self) -> &str;

    /// Carry out one assignment.
    ///
    /// Implementations should stop early once `cancel` fires; their result is
    /// discarded in that case.
    ///
    /// # Errors
    /// Returns an error when the work failed; the message becomes the task's block reason.
    async fn perform(&self, assignment: WorkAssignment, cancel: CancelSignal)
    -> Result<WorkOutput>;
}

/// Worker that runs a shell command per task.
///
/// The assignment is written to the command's stdin as JSON; stdout must contain a
/// JSON [`WorkOutput`]. A non-zero exit status is a failure carrying stderr.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: String,
    working_dir: PathBuf,
    name: String,
}

impl CommandWorker {
    /// Create a worker running `command` through `sh -c` in `working_dir`
    pub fn new(command: impl Into<String>, working_dir: PathBuf) -> Self {
        let command = command.into();
        let name = format!("command:{command}");
        Self {
            command,
            working_dir,
            name,
        }
    }
}

#[async_trait]
impl TaskWorker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(
        &self,
        assignment: WorkAssignment,
        mut cancel: CancelSignal,
    ) -> Result<WorkOutput> {
        let payload = to_vec(&assignment)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .env("FOREMAN_TASK_ID", assignment.task_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                ForemanError::Other(format!("Failed to start worker command: {error}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForemanError::Other("worker stdin unavailable".to_owned()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Other("worker stdout unavailable".to_owned()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ForemanError::Other("worker stderr unavailable".to_owned()))?;

        let feed = async move {
            // A command that ignores its input may exit before reading it.
            match stdin.write_all(&payload).await {
                Err(error) if error.kind() != ErrorKind::BrokenPipe => Err(error),
                _ => Ok(()),
            }
        };
        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (fed, read_out, read_err) = tokio::join!(
                feed,
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err)
            );
            fed?;
            read_out?;
            read_err?;
            let status = child.wait().await?;
            Ok::<_, ForemanError>((status, out, err))
        };

        let (status, out, err) = tokio::select! {
            finished = run => finished?,
            () = cancel.cancelled() => {
                tracing::info!("Worker for {} cancelled", assignment.task_id);
                return Err(ForemanError::Other("worker cancelled".to_owned()));
            }
        };

        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&err);
            return Err(ForemanError::Other(format!(
                "worker command exited with {status}: {}",
                stderr_text.trim()
            )));
        }

        from_slice(&out).map_err(|error| {
            ForemanError::Other(format!("worker output is not valid JSON: {error}"))
        })
    }
}
