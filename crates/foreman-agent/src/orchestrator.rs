//! The coordinator.
//!
//! [`Orchestrator`] owns the feature store, the history log, the legacy archive, the
//! workspace and the worker pool. Every status change and every history write goes
//! through it, and worker completions are processed one at a time, so the data model
//! needs no locks. The only exclusion discipline is over touch-set resource keys, which
//! is enforced before dispatch.

use core::mem;
use core::time::Duration;
use foreman_core::{
    BlockReason, ChangeRecord, ChangeType, ChangelogEntry, ConflictReport, ExecutionConfig,
    Exclusion, FeatureId, FeatureStatus, ForemanError, ImpactMatrix, Plan, PrdId, ResourceKey,
    Result, SnapshotHandle, Task, TaskId, TaskSpec, TaskStatus, TouchSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::archive::LegacyArchive;
use crate::executor::{
    BatchSelection, ConflictDetector, PoolEvent, ResourceClaims, Transaction, WorkerPool,
    WorkspaceState,
};
use crate::history::HistoryLog;
use crate::store::{CodeRequest, FeatureStore};
use crate::worker::{TaskWorker, WorkAssignment, WorkOutput};

/// External validation signal for an implemented task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    /// Accept the implementation
    Approved,
    /// Reject the implementation with a reason
    Rejected(String),
}

/// What happened during [`Orchestrator::run_until_idle`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Admission rounds that dispatched at least one task
    pub rounds: usize,
    /// Tasks dispatched, in dispatch order
    pub dispatched: Vec<TaskId>,
    /// Tasks that reached `Implemented`, in completion order
    pub implemented: Vec<TaskId>,
    /// Tasks that were blocked, with the reason
    pub blocked: BTreeMap<TaskId, BlockReason>,
    /// First exclusion seen for each task held back by a conflict
    pub exclusions: BTreeMap<TaskId, Exclusion>,
}

impl RunSummary {
    fn absorb(&mut self, selection: &BatchSelection) {
        if !selection.admitted.is_empty() {
            self.rounds += 1;
            self.dispatched.extend(selection.admitted.iter().cloned());
        }
        for exclusion in &selection.excluded.exclusions {
            self.exclusions
                .entry(exclusion.task.clone())
                .or_insert_with(|| exclusion.clone());
        }
    }
}

/// Single authority over task and feature status
pub struct Orchestrator {
    execution: ExecutionConfig,
    store: FeatureStore,
    history: HistoryLog,
    archive: LegacyArchive,
    workspace: Arc<WorkspaceState>,
    claims: ResourceClaims,
    detector: ConflictDetector,
    pool: Option<WorkerPool>,
    default_roles: BTreeSet<String>,
    halted: Option<String>,
}

impl Orchestrator {
    /// Create an orchestrator over existing state.
    ///
    /// Tasks still `InProgress` in `store` belong to a run that no longer exists; they
    /// are blocked as interrupted.
    ///
    /// # Errors
    /// Returns an error if interrupted tasks cannot be blocked.
    pub fn new(
        execution: ExecutionConfig,
        mut store: FeatureStore,
        history: HistoryLog,
        archive: LegacyArchive,
        workspace: Arc<WorkspaceState>,
    ) -> Result<Self> {
        let interrupted = store.mark_interrupted()?;
        if !interrupted.is_empty() {
            tracing::warn!("Blocked {} interrupted task(s)", interrupted.len());
        }

        Ok(Self {
            detector: ConflictDetector::new(execution.max_parallel_workers),
            execution,
            store,
            history,
            archive,
            workspace,
            claims: ResourceClaims::new(),
            pool: None,
            default_roles: BTreeSet::new(),
            halted: None,
        })
    }

    /// Orchestrator with empty in-memory state
    pub fn in_memory(execution: ExecutionConfig) -> Self {
        Self {
            detector: ConflictDetector::new(execution.max_parallel_workers),
            execution,
            store: FeatureStore::new(),
            history: HistoryLog::in_memory(),
            archive: LegacyArchive::in_memory(),
            workspace: WorkspaceState::in_memory(),
            claims: ResourceClaims::new(),
            pool: None,
            default_roles: BTreeSet::new(),
            halted: None,
        }
    }

    /// Use `worker` for dispatched tasks
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn TaskWorker>) -> Self {
        self.pool = Some(WorkerPool::new(worker));
        self
    }

    /// Roles credited in changelog entries when a worker names none
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.default_roles = roles.into_iter().collect();
        self
    }

    /// Start halted, as a previous run left it
    #[must_use]
    pub fn with_halt(mut self, reason: Option<String>) -> Self {
        self.halted = reason;
        self
    }

    /// Feature store (read only)
    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    /// Changelog (read only)
    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Legacy archive (read only)
    pub fn archive(&self) -> &LegacyArchive {
        &self.archive
    }

    /// Tracked workspace
    pub fn workspace(&self) -> &Arc<WorkspaceState> {
        &self.workspace
    }

    /// Resource keys held by running tasks
    pub fn claims(&self) -> &ResourceClaims {
        &self.claims
    }

    /// Why dispatching is halted, if it is
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Create a feature
    pub fn create_feature(&mut self, description: impl Into<String>) -> FeatureId {
        self.store.create_feature(description)
    }

    /// Attach a PRD to a feature.
    ///
    /// # Errors
    /// Returns `UnknownFeature` if the feature does not exist.
    pub fn attach_prd(
        &mut self,
        feature: FeatureId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<PrdId> {
        self.store.attach_prd(feature, title, body)
    }

    /// Create tasks under a feature, all or nothing.
    ///
    /// # Errors
    /// Returns the validation error of the first offending spec; nothing is stored.
    pub fn create_tasks(&mut self, feature: FeatureId, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        self.store.create_tasks(feature, specs)
    }

    /// Make `task` depend on `dependency`.
    ///
    /// A running task whose new dependency is not `Done` is stopped and blocked.
    ///
    /// # Errors
    /// Returns `UnknownTask` or `CycleDetected`; nothing changes on error.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId) -> Result<()> {
        self.store.add_dependency(task, dependency)?;

        if self.store.status(task)? == TaskStatus::InProgress
            && self.store.status(dependency)? != TaskStatus::Done
        {
            self.stop(task);
            self.store.block(
                task,
                BlockReason::UnmetDependency {
                    dependency: dependency.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Tasks whose dependencies are all `Done`, excluding running and finished tasks.
    pub fn eligible_tasks(&self, scope: Option<FeatureId>) -> Vec<&Task> {
        self.store.eligible_tasks(scope)
    }

    /// Install an implementation plan.
    ///
    /// The impact-matrix keys become the task's touch set. Overlap with another planned
    /// or running task that is not ordered with this one is noted in the plan, or
    /// rejected when strict planning is enabled.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the task is `PRDApproved`, `Planned` or
    /// `Blocked`, and `ConflictDetected` for overlaps under strict planning. A
    /// superseding plan rejected that way regresses the task to `Draft`.
    pub fn plan(
        &mut self,
        task: &TaskId,
        impact_matrix: ImpactMatrix,
        notes: Vec<String>,
    ) -> Result<Plan> {
        let status = self.store.status(task)?;
        let feature = self.store.task(task)?.feature_id;
        let has_prd = self.store.feature(feature)?.has_prd();
        let promote = status == TaskStatus::Draft && has_prd;
        let replannable = match status {
            TaskStatus::PrdApproved | TaskStatus::Planned => true,
            TaskStatus::Blocked => has_prd,
            _ => promote,
        };
        if !replannable {
            return Err(ForemanError::InvalidTransition {
                task: task.clone(),
                from: status,
                to: TaskStatus::Planned,
            });
        }

        let mut plan = Plan::new(task.clone(), impact_matrix);
        plan.duplicate_risk_notes = notes;
        let touch_set = plan.touch_set();

        if let Some(exclusion) = self.planning_overlap(task, &touch_set)? {
            if self.execution.strict_planning {
                if status == TaskStatus::Planned {
                    self.store.retire_plan(task);
                    self.store.dequeue(task);
                    self.store.transition(task, TaskStatus::Draft)?;
                }
                tracing::warn!("Plan for {task} rejected: {}", exclusion.reason());
                return Err(ForemanError::ConflictDetected(ConflictReport::single(
                    exclusion,
                )));
            }
            let shared: Vec<&str> = exclusion.keys.iter().map(ResourceKey::as_str).collect();
            plan.duplicate_risk_notes.push(format!(
                "{} on {}",
                exclusion.reason(),
                shared.join(", ")
            ));
        }

        if promote {
            self.store.transition(task, TaskStatus::PrdApproved)?;
        }
        if status != TaskStatus::Planned {
            self.store.transition(task, TaskStatus::Planned)?;
        }
        self.store.set_touch_set(task, touch_set)?;
        self.store.set_plan(plan.clone());
        tracing::info!("Planned {task} ({} resource(s))", plan.impact_matrix.len());
        Ok(plan)
    }

    fn planning_overlap(&self, task: &TaskId, touch_set: &TouchSet) -> Result<Option<Exclusion>> {
        let mut candidate = self.store.task(task)?.clone();
        candidate.touch_set.clone_from(touch_set);
        let others = self.store.tasks().filter(|other| {
            matches!(other.status, TaskStatus::Planned | TaskStatus::InProgress)
        });
        Ok(ConflictDetector::overlap_with(
            &candidate,
            others,
            self.store.graph(),
        ))
    }

    /// Queue a planned task for dispatch, with an optional deadline overriding the
    /// configured default.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the task is `Planned`.
    pub fn request_code(&mut self, task: &TaskId, deadline: Option<Duration>) -> Result<()> {
        let status = self.store.status(task)?;
        if status != TaskStatus::Planned {
            return Err(ForemanError::InvalidTransition {
                task: task.clone(),
                from: status,
                to: TaskStatus::InProgress,
            });
        }
        self.store.enqueue(task, deadline);
        tracing::info!("Queued {task} for dispatch");
        Ok(())
    }

    /// Replace a task's touch set.
    ///
    /// If the task is planned or running and the new set overlaps a running task, the
    /// revised task is blocked (and its worker stopped); the running task is unaffected.
    ///
    /// # Errors
    /// Returns `UnknownTask`, or an error if the task is already `Done`.
    pub fn revise_touch_set(
        &mut self,
        task: &TaskId,
        touch_set: TouchSet,
    ) -> Result<Option<Exclusion>> {
        let status = self.store.status(task)?;
        if status.is_terminal() {
            return Err(ForemanError::Other(format!(
                "task {task} is done; its touch set is final"
            )));
        }

        let conflict = self.claims.conflicts(task, &touch_set);
        match (status, conflict) {
            (TaskStatus::Planned | TaskStatus::InProgress, Some(exclusion)) => {
                self.stop(task);
                self.store.set_touch_set(task, touch_set)?;
                self.store.block(
                    task,
                    BlockReason::Conflict {
                        with: exclusion.conflicts_with.clone(),
                        keys: exclusion.keys.clone(),
                    },
                )?;
                return Ok(Some(exclusion));
            }
            (TaskStatus::InProgress, None) => {
                self.claims.release(task);
                self.claims.claim(task, &touch_set)?;
            }
            _ => {}
        }

        self.store.set_touch_set(task, touch_set)?;
        Ok(None)
    }

    /// Apply an external validation verdict. Returns the resulting status.
    ///
    /// Approval moves `Implemented -> Validated -> Done` (or `Validated -> Done`);
    /// rejection blocks the task.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the task is `Implemented` or `Validated`.
    pub fn record_verdict(&mut self, task: &TaskId, verdict: Verdict) -> Result<TaskStatus> {
        let status = self.store.status(task)?;
        match verdict {
            Verdict::Approved => {
                match status {
                    TaskStatus::Implemented => {
                        self.store.transition(task, TaskStatus::Validated)?;
                        self.store.transition(task, TaskStatus::Done)?;
                    }
                    TaskStatus::Validated => self.store.transition(task, TaskStatus::Done)?,
                    other => {
                        return Err(ForemanError::InvalidTransition {
                            task: task.clone(),
                            from: other,
                            to: TaskStatus::Validated,
                        });
                    }
                }
                let feature = self.store.task(task)?.feature_id;
                self.store.refresh_feature(feature)?;
                tracing::info!("Task {task} approved");
            }
            Verdict::Rejected(reason) => {
                if !matches!(status, TaskStatus::Implemented | TaskStatus::Validated) {
                    return Err(ForemanError::InvalidTransition {
                        task: task.clone(),
                        from: status,
                        to: TaskStatus::Blocked,
                    });
                }
                self.store.block(task, BlockReason::Rejected { reason })?;
            }
        }
        self.store.status(task)
    }

    /// Block every non-terminal task of a feature and release their claims.
    /// Already `Done` tasks are left as they are.
    ///
    /// # Errors
    /// Returns `UnknownFeature` if the feature does not exist.
    pub fn cancel_feature(&mut self, feature: FeatureId) -> Result<Vec<TaskId>> {
        let targets: Vec<TaskId> = self
            .store
            .tasks_of(feature)?
            .into_iter()
            .filter(|task| !matches!(task.status, TaskStatus::Done | TaskStatus::Blocked))
            .map(|task| task.id.clone())
            .collect();

        for task in &targets {
            self.stop(task);
            self.store.block(task, BlockReason::Cancelled)?;
        }
        tracing::info!("Cancelled feature {feature}: {} task(s) blocked", targets.len());
        Ok(targets)
    }

    /// Flag a feature as archived. Archived features keep their history but accept no
    /// new tasks or PRDs.
    ///
    /// # Errors
    /// Returns `UnknownFeature`, or an error while any of its tasks is running.
    pub fn archive_feature(&mut self, feature: FeatureId) -> Result<()> {
        let running = self
            .store
            .tasks_of(feature)?
            .iter()
            .any(|task| task.status == TaskStatus::InProgress);
        if running {
            return Err(ForemanError::Other(format!(
                "feature {feature} has running tasks; cancel it first"
            )));
        }
        self.store.feature_mut(feature)?.archived = true;
        tracing::info!("Archived feature {feature}");
        Ok(())
    }

    /// Clear a halt caused by a history-integrity failure. Returns whether one was set.
    pub fn resume(&mut self) -> bool {
        let was_halted = self.halted.take().is_some();
        if was_halted {
            tracing::info!("Dispatching resumed");
        }
        was_halted
    }

    /// Take a snapshot of a resource outside of any task commit.
    ///
    /// # Errors
    /// Returns `SnapshotWriteFailure` if the snapshot cannot be persisted.
    pub async fn snapshot(
        &mut self,
        key: &ResourceKey,
        reason: impl Into<String>,
    ) -> Result<SnapshotHandle> {
        self.archive.snapshot(&self.workspace, key, reason).await
    }

    /// Restore the content captured by `handle`.
    ///
    /// The revert is a forward change: the current content is snapshotted first and
    /// exactly one changelog entry is recorded.
    ///
    /// # Errors
    /// Returns `Halted`, `UnknownSnapshot`, an error if a running task holds the
    /// resource, or `SnapshotWriteFailure` (which halts dispatching).
    pub async fn revert_to(&mut self, handle: &SnapshotHandle) -> Result<ChangelogEntry> {
        self.ensure_running()?;
        let change = self.archive.revert_change(handle)?;
        let key = change.key().clone();
        if let Some(holder) = self.claims.holder(&key) {
            return Err(ForemanError::Other(format!(
                "resource {key} is claimed by running task {holder}"
            )));
        }

        if let Err(error) = self
            .archive
            .snapshot(&self.workspace, &key, format!("revert to {handle}"))
            .await
        {
            self.halt(&error);
            return Err(error);
        }
        let transaction = match Transaction::apply(&self.workspace, &[change]).await {
            Ok(transaction) => transaction,
            Err(error) => {
                if error.blocks_progress() {
                    self.halt(&error);
                }
                return Err(error);
            }
        };

        let record = ChangeRecord::new(ChangeType::Fix, format!("Revert {key} to snapshot {handle}"))
            .with_resources([key])
            .with_roles(self.default_roles.iter().cloned());
        let entry = match self.history.record(record) {
            Ok(entry) => entry.clone(),
            Err(error) => {
                tracing::error!("Changelog write for revert to {handle} failed: {error}");
                if let Err(rollback_error) = transaction.rollback().await {
                    tracing::error!("Revert to {handle} left changes behind: {rollback_error}");
                }
                self.halt(&error);
                return Err(error);
            }
        };
        transaction.commit();
        Ok(entry)
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(ForemanError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Run one admission round: dispatch every queued, eligible task that does not
    /// conflict with a running or newly admitted task, up to the worker bound.
    /// Cancelled workers still winding down count against the bound. An admitted task
    /// that cannot be started is blocked and left out of the returned admissions.
    ///
    /// # Errors
    /// Returns `Halted` while halted, or a configuration error if tasks are queued but
    /// no worker is configured.
    pub async fn dispatch_ready(&mut self) -> Result<BatchSelection> {
        self.ensure_running()?;

        let mut selection = {
            let queue = self.store.queue();
            let candidates: Vec<&Task> = self
                .store
                .eligible_tasks(None)
                .into_iter()
                .filter(|task| task.status == TaskStatus::Planned && queue.contains_key(&task.id))
                .collect();
            if candidates.is_empty() {
                return Ok(BatchSelection::default());
            }
            let Some(pool) = &self.pool else {
                return Err(ForemanError::Config(
                    "no worker configured; queued tasks cannot be dispatched".to_owned(),
                ));
            };
            self.detector.select(
                &candidates,
                self.store.graph(),
                &self.claims,
                pool.occupied_slots(),
            )
        };

        let admitted = mem::take(&mut selection.admitted);
        let mut started = Vec::with_capacity(admitted.len());
        for task in admitted {
            match self.start(&task).await {
                Ok(()) => started.push(task),
                Err(error) => {
                    tracing::warn!("Could not start {task}: {error}");
                    self.claims.release(&task);
                    self.store.block(
                        &task,
                        BlockReason::WorkerFailed {
                            message: format!("failed to start: {error}"),
                        },
                    )?;
                }
            }
        }
        selection.admitted = started;
        for exclusion in &selection.excluded.exclusions {
            tracing::info!("Holding back {}: {}", exclusion.task, exclusion.reason());
        }
        Ok(selection)
    }

    async fn start(&mut self, id: &TaskId) -> Result<()> {
        let task = self.store.task(id)?.clone();
        let resources = self
            .workspace
            .snapshot(&task.touch_set)
            .await?
            .into_resources();
        let Some(pool) = self.pool.as_mut() else {
            return Err(ForemanError::Config("no worker configured".to_owned()));
        };

        self.claims.claim(id, &task.touch_set)?;
        let request = self.store.dequeue(id);
        self.store.transition(id, TaskStatus::InProgress)?;
        self.store.task_mut(id)?.assigned_worker = Some(pool.worker_name().to_owned());
        if self
            .store
            .feature_mut(task.feature_id)?
            .advance_to(FeatureStatus::Active)
        {
            tracing::info!("Feature {} is active", task.feature_id);
        }

        let assignment = WorkAssignment::new(&task, self.store.plan(id).cloned(), resources);
        let deadline = request
            .as_ref()
            .and_then(CodeRequest::deadline)
            .or_else(|| self.execution.task_deadline());
        pool.dispatch(assignment, deadline)?;
        Ok(())
    }

    /// Dispatch and process completions until nothing is running and nothing more
    /// can be admitted.
    ///
    /// # Errors
    /// Returns `Halted` if dispatching is halted, and `SnapshotWriteFailure` (after
    /// halting) if a commit could not be archived.
    pub async fn run_until_idle(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            let selection = self.dispatch_ready().await?;
            summary.absorb(&selection);

            let Some(pool) = self.pool.as_mut() else {
                break;
            };
            let event = pool.next_event().await;
            if matches!(event, PoolEvent::Idle) {
                break;
            }
            self.process(event, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn process(&mut self, event: PoolEvent, summary: &mut RunSummary) -> Result<()> {
        match event {
            PoolEvent::Idle => Ok(()),
            PoolEvent::Drained { task_id } => {
                tracing::debug!("Slot of cancelled dispatch for {task_id} is free");
                Ok(())
            }
            PoolEvent::TimedOut { task_id, after } => self.fail(
                &task_id,
                BlockReason::Timeout {
                    after_ms: after.as_millis() as u64,
                },
                summary,
            ),
            PoolEvent::Finished(report) => match report.outcome {
                Ok(output) => self.commit(&report.task_id, output, summary).await,
                Err(error) => {
                    tracing::warn!("Worker for {} failed: {error}", report.task_id);
                    self.fail(
                        &report.task_id,
                        BlockReason::WorkerFailed {
                            message: error.to_string(),
                        },
                        summary,
                    )
                }
            },
        }
    }

    /// Snapshot, apply, record, release, transition. In that order.
    ///
    /// Changes are applied as one [`Transaction`]: a change that cannot be applied, or
    /// a changelog entry that cannot be written, leaves the workspace as it was.
    async fn commit(
        &mut self,
        id: &TaskId,
        output: WorkOutput,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let task = self.store.task(id)?.clone();

        let undeclared = output.undeclared_keys(&task.touch_set);
        if !undeclared.is_empty() {
            let error = ForemanError::UndeclaredResource {
                task: id.clone(),
                keys: undeclared.clone(),
            };
            tracing::warn!("{error}");
            return self.fail(
                id,
                BlockReason::UndeclaredResource {
                    keys: undeclared.into_iter().collect(),
                },
                summary,
            );
        }

        let description = if output.summary.is_empty() {
            task.description.clone()
        } else {
            output.summary.clone()
        };
        let keys: BTreeSet<ResourceKey> =
            output.changes.iter().map(|change| change.key().clone()).collect();

        for key in &keys {
            let reason = format!("{id}: {description}");
            if let Err(error) = self.archive.snapshot(&self.workspace, key, reason).await {
                if error.blocks_progress() {
                    self.fail(
                        id,
                        BlockReason::SnapshotWriteFailure {
                            message: error.to_string(),
                        },
                        summary,
                    )?;
                    self.halt(&error);
                    return Err(error);
                }
                return self.fail(
                    id,
                    BlockReason::WorkerFailed {
                        message: error.to_string(),
                    },
                    summary,
                );
            }
        }

        let transaction = match Transaction::apply(&self.workspace, &output.changes).await {
            Ok(transaction) => transaction,
            Err(error) if error.blocks_progress() => {
                self.fail(
                    id,
                    BlockReason::WorkerFailed {
                        message: error.to_string(),
                    },
                    summary,
                )?;
                self.halt(&error);
                return Err(error);
            }
            Err(error) => {
                return self.fail(
                    id,
                    BlockReason::WorkerFailed {
                        message: format!("failed to apply changes: {error}"),
                    },
                    summary,
                );
            }
        };

        let roles = if output.roles.is_empty() {
            self.default_roles.clone()
        } else {
            output.roles
        };
        let record = ChangeRecord::new(output.change_type, description)
            .with_resources(keys)
            .with_roles(roles)
            .with_task(id.clone());
        if let Err(error) = self.history.record(record) {
            tracing::error!("Changelog write for {id} failed: {error}");
            if let Err(rollback_error) = transaction.rollback().await {
                tracing::error!("Changes of {id} could not be undone: {rollback_error}");
            }
            self.fail(
                id,
                BlockReason::HistoryWriteFailure {
                    message: error.to_string(),
                },
                summary,
            )?;
            self.halt(&error);
            return Err(error);
        }

        let changed = transaction.commit();
        self.claims.release(id);
        self.store.transition(id, TaskStatus::Implemented)?;
        summary.implemented.push(id.clone());
        tracing::info!("Task {id} implemented ({changed} change(s))");
        Ok(())
    }

    fn fail(&mut self, id: &TaskId, reason: BlockReason, summary: &mut RunSummary) -> Result<()> {
        self.claims.release(id);
        self.store.block(id, reason.clone())?;
        summary.blocked.insert(id.clone(), reason);
        Ok(())
    }

    /// Cancel a task's live dispatch, if any, and release its keys.
    fn stop(&mut self, id: &TaskId) {
        if self.pool.as_mut().is_some_and(|pool| pool.cancel(id)) {
            tracing::info!("Stopped worker for {id}");
        }
        self.claims.release(id);
    }

    /// Stop all forward progress until [`Self::resume`] is called.
    fn halt(&mut self, error: &ForemanError) {
        tracing::error!("Halting dispatch: {error}");
        let interrupted = self
            .pool
            .as_mut()
            .map(WorkerPool::cancel_all)
            .unwrap_or_default();
        for id in interrupted {
            self.claims.release(&id);
            if let Err(block_error) = self.store.block(&id, BlockReason::Interrupted) {
                tracing::error!("Could not block {id} while halting: {block_error}");
            }
        }
        self.halted = Some(error.to_string());
    }
}
