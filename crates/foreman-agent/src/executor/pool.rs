use core::fmt;
use core::future::pending;
use core::result::Result as CoreResult;
use core::time::Duration;
use foreman_core::{ForemanError, Result, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use crate::worker::{CancelSignal, TaskWorker, WorkAssignment, WorkOutput};

/// Identifies one dispatch of a task; a re-dispatched task gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchId(Uuid);

impl DispatchId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Completion message sent back to the coordinator
#[derive(Debug)]
pub struct WorkerReport {
    /// Dispatch this report belongs to
    pub dispatch_id: DispatchId,
    /// Task that was executed
    pub task_id: TaskId,
    /// Worker result
    pub outcome: Result<WorkOutput>,
}

/// Something the coordinator has to react to
#[derive(Debug)]
pub enum PoolEvent {
    /// A live dispatch finished, successfully or not
    Finished(WorkerReport),
    /// A live dispatch passed its deadline; its worker was asked to stop
    TimedOut {
        /// Task that timed out
        task_id: TaskId,
        /// Deadline that elapsed
        after: Duration,
    },
    /// A cancelled dispatch stopped, on its own or by being aborted; its slot is free
    Drained {
        /// Task whose old dispatch stopped
        task_id: TaskId,
    },
    /// Nothing is running or draining
    Idle,
}

/// How long a cancelled worker may keep running before it is aborted
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct RunningTask {
    dispatch_id: DispatchId,
    join_id: Id,
    abort: AbortHandle,
    cancel: watch::Sender<bool>,
    deadline: Option<(Instant, Duration)>,
}

/// Cancelled dispatch whose future has not been joined yet
#[derive(Debug)]
struct DrainingTask {
    task_id: TaskId,
    abort: AbortHandle,
    abort_at: Option<Instant>,
}

enum Wake {
    Joined(Option<CoreJoin>),
    Deadline,
}

type CoreJoin = CoreResult<(Id, WorkerReport), JoinError>;

/// Bounded set of in-flight workers.
///
/// The pool owns the spawned worker futures and turns their results, panics and
/// deadlines into [`PoolEvent`]s, one at a time. Cancelled or timed-out dispatches
/// keep occupying a slot until their future ends; one that ignores cancellation is
/// aborted once the grace period passes. Whatever they report is discarded.
pub struct WorkerPool {
    worker: Arc<dyn TaskWorker>,
    join_set: JoinSet<WorkerReport>,
    spawned: HashMap<Id, (TaskId, DispatchId)>,
    running: HashMap<TaskId, RunningTask>,
    draining: HashMap<Id, DrainingTask>,
    grace: Duration,
}

impl WorkerPool {
    /// Create a pool executing every assignment with `worker`
    pub fn new(worker: Arc<dyn TaskWorker>) -> Self {
        Self {
            worker,
            join_set: JoinSet::new(),
            spawned: HashMap::new(),
            running: HashMap::new(),
            draining: HashMap::new(),
            grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Abort cancelled workers `grace` after cancellation
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Name of the worker implementation
    pub fn worker_name(&self) -> &str {
        self.worker.name()
    }

    /// Number of live dispatches
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Live dispatches plus cancelled ones still winding down
    pub fn occupied_slots(&self) -> usize {
        self.running.len() + self.draining.len()
    }

    /// Whether `task` has a live dispatch
    pub fn is_running(&self, task: &TaskId) -> bool {
        self.running.contains_key(task)
    }

    /// Spawn a worker for `assignment`.
    ///
    /// # Errors
    /// Returns an error if the task already has a live dispatch.
    pub fn dispatch(
        &mut self,
        assignment: WorkAssignment,
        deadline: Option<Duration>,
    ) -> Result<DispatchId> {
        let task_id = assignment.task_id.clone();
        if self.running.contains_key(&task_id) {
            return Err(ForemanError::Other(format!(
                "task {task_id} is already running"
            )));
        }

        let dispatch_id = DispatchId::new();
        let (cancel, signal) = CancelSignal::channel();
        let worker = Arc::clone(&self.worker);
        let report_task = task_id.clone();

        let abort = self.join_set.spawn(async move {
            let outcome = worker.perform(assignment, signal).await;
            WorkerReport {
                dispatch_id,
                task_id: report_task,
                outcome,
            }
        });

        let join_id = abort.id();
        self.spawned.insert(join_id, (task_id.clone(), dispatch_id));
        self.running.insert(
            task_id.clone(),
            RunningTask {
                dispatch_id,
                join_id,
                abort,
                cancel,
                deadline: deadline.map(|after| (Instant::now() + after, after)),
            },
        );
        tracing::info!("Dispatched {task_id} ({dispatch_id})");
        Ok(dispatch_id)
    }

    /// Signal the worker of `task` to stop. The dispatch stops being live but keeps
    /// its slot until the worker returns or is aborted.
    ///
    /// Returns `false` if the task had no live dispatch.
    pub fn cancel(&mut self, task: &TaskId) -> bool {
        let Some(running) = self.running.remove(task) else {
            return false;
        };
        if running.cancel.send(true).is_err() {
            tracing::debug!("Worker for {task} already finished");
        }
        self.draining.insert(
            running.join_id,
            DrainingTask {
                task_id: task.clone(),
                abort: running.abort,
                abort_at: Some(Instant::now() + self.grace),
            },
        );
        true
    }

    /// Cancel every live dispatch, returning the affected tasks.
    pub fn cancel_all(&mut self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self.running.keys().cloned().collect();
        tasks.sort();
        for task in &tasks {
            self.cancel(task);
        }
        tasks
    }

    /// Wait for the next completion or deadline.
    pub async fn next_event(&mut self) -> PoolEvent {
        loop {
            if self.running.is_empty() && self.draining.is_empty() {
                return PoolEvent::Idle;
            }

            let next_deadline = self
                .running
                .values()
                .filter_map(|running| running.deadline.map(|(at, _)| at))
                .chain(self.draining.values().filter_map(|draining| draining.abort_at))
                .min();

            let wake = tokio::select! {
                joined = self.join_set.join_next_with_id() => Wake::Joined(joined),
                () = wait_until(next_deadline) => Wake::Deadline,
            };

            let event = match wake {
                Wake::Deadline => self.expire(),
                Wake::Joined(None) => {
                    // Nothing left to join although dispatches are recorded as live.
                    self.running.clear();
                    self.draining.clear();
                    Some(PoolEvent::Idle)
                }
                Wake::Joined(Some(joined)) => self.accept(joined),
            };

            if let Some(event) = event {
                return event;
            }
        }
    }

    fn accept(&mut self, joined: CoreJoin) -> Option<PoolEvent> {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(error) => error.id(),
        };
        if let Some(drained) = self.draining.remove(&id) {
            self.spawned.remove(&id);
            tracing::debug!("Cancelled worker for {} stopped", drained.task_id);
            return Some(PoolEvent::Drained {
                task_id: drained.task_id,
            });
        }

        let report = match joined {
            Ok((_, report)) => {
                self.spawned.remove(&id);
                report
            }
            Err(error) => {
                let (task_id, dispatch_id) = self.spawned.remove(&id)?;
                let message = if error.is_panic() {
                    "worker panicked".to_owned()
                } else {
                    format!("worker aborted: {error}")
                };
                WorkerReport {
                    dispatch_id,
                    task_id,
                    outcome: Err(ForemanError::Other(message)),
                }
            }
        };

        let live = self
            .running
            .get(&report.task_id)
            .is_some_and(|running| running.dispatch_id == report.dispatch_id);
        if !live {
            tracing::debug!(
                "Discarding stale report for {} ({})",
                report.task_id,
                report.dispatch_id
            );
            return None;
        }

        self.running.remove(&report.task_id);
        Some(PoolEvent::Finished(report))
    }

    fn expire(&mut self) -> Option<PoolEvent> {
        let now = Instant::now();
        for draining in self.draining.values_mut() {
            if draining.abort_at.is_some_and(|at| at <= now) {
                tracing::warn!(
                    "Worker for {} ignored cancellation, aborting it",
                    draining.task_id
                );
                draining.abort.abort();
                draining.abort_at = None;
            }
        }

        let (task_id, after) = self
            .running
            .iter()
            .filter_map(|(task, running)| running.deadline.map(|(at, after)| (at, task, after)))
            .filter(|(at, _, _)| *at <= now)
            .min_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(right.1)))
            .map(|(_, task, after)| (task.clone(), after))?;

        self.cancel(&task_id);
        tracing::warn!("Task {task_id} exceeded its deadline of {after:?}");
        Some(PoolEvent::TimedOut { task_id, after })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::{FeatureId, ResourceChange, ResourceKey, Task, TaskSpec};
    use std::collections::BTreeMap;

    struct EchoWorker;

    #[async_trait]
    impl TaskWorker for EchoWorker {
        fn name(&self) -> &str {
            "echo"
        }

        async fn perform(
            &self,
            assignment: WorkAssignment,
            _cancel: CancelSignal,
        ) -> Result<WorkOutput> {
            if assignment.description.contains("panic") {
                panic!("worker blew up");
            }
            if assignment.description.contains("hang") {
                pending::<()>().await;
            }
            Ok(WorkOutput::with_changes(vec![ResourceChange::Create {
                key: ResourceKey::new(format!("{}.txt", assignment.task_id)),
                content: assignment.description.into(),
            }]))
        }
    }

    fn assignment(id: &str, description: &str) -> WorkAssignment {
        let task = Task::from_spec(FeatureId::new(1), TaskSpec::new(id, description)).unwrap();
        WorkAssignment::new(&task, None, BTreeMap::new())
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(Arc::new(EchoWorker)).with_grace(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_finished_report_then_idle() {
        let mut pool = pool();
        let dispatch = pool.dispatch(assignment("T1", "work"), None).unwrap();
        assert_eq!(pool.running_count(), 1);

        let PoolEvent::Finished(report) = pool.next_event().await else {
            panic!("expected a finished report");
        };
        assert_eq!(report.dispatch_id, dispatch);
        assert_eq!(report.outcome.unwrap().changes.len(), 1);
        assert!(matches!(pool.next_event().await, PoolEvent::Idle));
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_rejected() {
        let mut pool = pool();
        pool.dispatch(assignment("T1", "hang"), None).unwrap();
        pool.dispatch(assignment("T1", "hang"), None).unwrap_err();
        pool.cancel_all();
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let mut pool = pool();
        pool.dispatch(assignment("T1", "hang"), Some(Duration::from_millis(20)))
            .unwrap();

        let PoolEvent::TimedOut { task_id, after } = pool.next_event().await else {
            panic!("expected a timeout");
        };
        assert_eq!(task_id, TaskId::new("T1"));
        assert_eq!(after, Duration::from_millis(20));
        assert!(!pool.is_running(&task_id));
        assert_eq!(pool.occupied_slots(), 1);
        assert!(matches!(pool.next_event().await, PoolEvent::Drained { .. }));
        assert!(matches!(pool.next_event().await, PoolEvent::Idle));
    }

    #[tokio::test]
    async fn test_panicking_worker_reports_failure() {
        let mut pool = pool();
        pool.dispatch(assignment("T1", "panic"), None).unwrap();

        let PoolEvent::Finished(report) = pool.next_event().await else {
            panic!("expected a finished report");
        };
        let error = report.outcome.unwrap_err();
        assert_eq!(error.to_string(), "worker panicked");
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_is_forgotten() {
        let mut pool = pool();
        pool.dispatch(assignment("T1", "hang"), None).unwrap();
        assert!(pool.cancel(&TaskId::new("T1")));
        assert!(!pool.cancel(&TaskId::new("T1")));
        assert!(matches!(
            pool.next_event().await,
            PoolEvent::Drained { task_id } if task_id == TaskId::new("T1")
        ));
        assert!(matches!(pool.next_event().await, PoolEvent::Idle));
    }

    #[tokio::test]
    async fn test_ignored_cancellation_holds_slot_until_aborted() {
        let mut pool = WorkerPool::new(Arc::new(EchoWorker)).with_grace(Duration::from_millis(50));
        pool.dispatch(assignment("T1", "hang"), None).unwrap();
        pool.cancel(&TaskId::new("T1"));
        assert_eq!(pool.running_count(), 0);
        assert_eq!(pool.occupied_slots(), 1);

        let started = Instant::now();
        assert!(matches!(pool.next_event().await, PoolEvent::Drained { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.occupied_slots(), 0);
    }
}
