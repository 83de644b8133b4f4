//! Feature store: the single source of truth for features, tasks and plans.
//!
//! Read access is public. Status changes go through crate-private transition
//! methods so that only the orchestrator can advance a task.

use chrono::{DateTime, Utc};
use core::time::Duration;
use foreman_core::{
    BlockReason, Feature, FeatureId, FeatureStatus, ForemanError, Plan, Prd, PrdId, Result, Task,
    TaskId, TaskSpec, TaskStatus, TouchSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::executor::TaskGraph;

/// A pending `code` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRequest {
    /// When the request was made
    pub requested_at: DateTime<Utc>,
    /// Per-task deadline overriding the configured default, in milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl CodeRequest {
    /// Per-task deadline, if one was given
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Serializable content of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    /// Features by id
    pub features: BTreeMap<FeatureId, Feature>,
    /// Tasks by id
    pub tasks: BTreeMap<TaskId, Task>,
    /// PRD artifacts by id
    #[serde(default)]
    pub prds: BTreeMap<PrdId, Prd>,
    /// Current plan per task
    #[serde(default)]
    pub plans: BTreeMap<TaskId, Plan>,
    /// Superseded plans, oldest first
    #[serde(default)]
    pub archived_plans: Vec<Plan>,
    /// Tasks with a pending `code` request
    #[serde(default)]
    pub queue: BTreeMap<TaskId, CodeRequest>,
    /// Last feature sequence number handed out
    #[serde(default)]
    pub last_feature: u64,
    /// Last PRD sequence number handed out
    #[serde(default)]
    pub last_prd: u64,
}

/// Holds features and their tasks
#[derive(Debug, Default)]
pub struct FeatureStore {
    state: ProjectState,
    graph: TaskGraph,
}

impl FeatureStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted state.
    ///
    /// # Errors
    /// Returns an error if the stored dependencies are inconsistent.
    pub fn from_state(state: ProjectState) -> Result<Self> {
        let graph = TaskGraph::from_tasks(state.tasks.values())?;
        Ok(Self { state, graph })
    }

    /// Serializable view of the store
    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    /// Dependency graph over all tasks
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Create a feature in `Draft`
    pub fn create_feature(&mut self, description: impl Into<String>) -> FeatureId {
        self.state.last_feature += 1;
        let id = FeatureId::new(self.state.last_feature);
        self.state
            .features
            .insert(id, Feature::new(id, description.into()));
        tracing::info!("Created feature {id}");
        id
    }

    /// Attach a PRD artifact.
    ///
    /// The feature moves to `Scoped` and its `Draft` tasks become `PRDApproved`.
    ///
    /// # Errors
    /// Returns `UnknownFeature` if the feature does not exist.
    pub fn attach_prd(
        &mut self,
        feature: FeatureId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<PrdId> {
        if self.feature(feature)?.archived {
            return Err(ForemanError::Other(format!("feature {feature} is archived")));
        }

        self.state.last_prd += 1;
        let id = PrdId::new(self.state.last_prd);
        let record = self.feature_mut(feature)?;
        record.prd_ids.push(id);
        record.advance_to(FeatureStatus::Scoped);
        let drafts: Vec<TaskId> = record.task_ids.iter().cloned().collect();

        self.state.prds.insert(
            id,
            Prd {
                id,
                feature_id: feature,
                title: title.into(),
                body: body.into(),
                attached_at: Utc::now(),
            },
        );

        for task in drafts {
            if self.status(&task)? == TaskStatus::Draft {
                self.transition(&task, TaskStatus::PrdApproved)?;
            }
        }
        tracing::info!("Attached PRD {id} to feature {feature}");
        Ok(id)
    }

    /// Create tasks under a feature, all or nothing.
    ///
    /// Specs may depend on existing tasks or on each other. New tasks start as `Draft`,
    /// or `PRDApproved` when the feature already has a PRD.
    ///
    /// # Errors
    /// Returns `UnknownFeature`, `AcceptanceCriteriaLimitExceeded`, `DuplicateTask`,
    /// `UnknownDependency` or `CycleDetected`; nothing is stored on error.
    pub fn create_tasks(&mut self, feature: FeatureId, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        let record = self.feature(feature)?;
        if record.archived {
            return Err(ForemanError::Other(format!("feature {feature} is archived")));
        }
        let approved = record.has_prd();

        let tasks = specs
            .into_iter()
            .map(|spec| Task::from_spec(feature, spec))
            .collect::<Result<Vec<Task>>>()?;
        let entries: Vec<(TaskId, BTreeSet<TaskId>)> = tasks
            .iter()
            .map(|task| (task.id.clone(), task.dependencies.clone()))
            .collect();
        self.graph.add_tasks(&entries)?;

        let mut created = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if approved {
                task.status = TaskStatus::PrdApproved;
            }
            created.push(task.id.clone());
            self.state.tasks.insert(task.id.clone(), task);
        }
        self.feature_mut(feature)?
            .task_ids
            .extend(created.iter().cloned());

        tracing::info!("Created {} task(s) under feature {feature}", created.len());
        Ok(created)
    }

    /// Make `task` depend on `dependency`.
    ///
    /// # Errors
    /// Returns `UnknownTask` or `CycleDetected`; nothing changes on error.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId) -> Result<()> {
        self.graph.add_dependency(task, dependency)?;
        self.task_mut(task)?.dependencies.insert(dependency.clone());
        tracing::debug!("{task} now depends on {dependency}");
        Ok(())
    }

    /// Look up a feature.
    ///
    /// # Errors
    /// Returns `UnknownFeature` if absent.
    pub fn feature(&self, id: FeatureId) -> Result<&Feature> {
        self.state
            .features
            .get(&id)
            .ok_or(ForemanError::UnknownFeature(id))
    }

    /// All features in id order
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.state.features.values()
    }

    /// Look up a task.
    ///
    /// # Errors
    /// Returns `UnknownTask` if absent.
    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.state
            .tasks
            .get(id)
            .ok_or_else(|| ForemanError::UnknownTask(id.clone()))
    }

    /// All tasks in id order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.state.tasks.values()
    }

    /// Tasks belonging to a feature, in id order.
    ///
    /// # Errors
    /// Returns `UnknownFeature` if absent.
    pub fn tasks_of(&self, feature: FeatureId) -> Result<Vec<&Task>> {
        let record = self.feature(feature)?;
        record.task_ids.iter().map(|id| self.task(id)).collect()
    }

    /// Current status of a task.
    ///
    /// # Errors
    /// Returns `UnknownTask` if absent.
    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.task(id).map(|task| task.status)
    }

    /// Current plan of a task
    pub fn plan(&self, id: &TaskId) -> Option<&Plan> {
        self.state.plans.get(id)
    }

    /// Superseded plans, oldest first
    pub fn archived_plans(&self) -> &[Plan] {
        &self.state.archived_plans
    }

    /// A PRD artifact
    pub fn prd(&self, id: PrdId) -> Option<&Prd> {
        self.state.prds.get(&id)
    }

    /// Pending `code` requests
    pub fn queue(&self) -> &BTreeMap<TaskId, CodeRequest> {
        &self.state.queue
    }

    /// Tasks whose dependencies are all `Done`, excluding `InProgress` and `Done` tasks,
    /// optionally limited to one feature. Ordered by task id.
    pub fn eligible_tasks(&self, scope: Option<FeatureId>) -> Vec<&Task> {
        let tasks = &self.state.tasks;
        let mut eligible: Vec<&Task> = self
            .graph
            .eligible_tasks(|id| tasks.get(id).map(|task| task.status))
            .filter_map(|id| tasks.get(id))
            .filter(|task| scope.is_none_or(|feature| task.feature_id == feature))
            .collect();
        eligible.sort_by(|left, right| left.id.cmp(&right.id));
        eligible
    }

    /// Layers of mutually independent tasks
    pub fn topological_batches(&self) -> Vec<Vec<TaskId>> {
        self.graph.topological_batches()
    }

    /// Move a task along an edge of the state machine.
    ///
    /// Leaving `Blocked` clears the block reason; leaving `InProgress` clears the
    /// assigned worker. A blocked task may only be replanned once its feature has a
    /// PRD, so cancelling a `Draft` task never skips `PRDApproved`.
    pub(crate) fn transition(&mut self, id: &TaskId, next: TaskStatus) -> Result<()> {
        let task = self.task(id)?;
        let current = task.status;
        let skips_prd = current == TaskStatus::Blocked
            && next == TaskStatus::Planned
            && !self.feature(task.feature_id)?.has_prd();
        if !current.can_transition_to(next) || skips_prd {
            return Err(ForemanError::InvalidTransition {
                task: id.clone(),
                from: current,
                to: next,
            });
        }

        let task = self.task_mut(id)?;
        task.status = next;
        if current == TaskStatus::Blocked {
            task.blocked_reason = None;
        }
        if current == TaskStatus::InProgress {
            task.assigned_worker = None;
        }
        tracing::debug!("Task {id}: {current} -> {next}");
        Ok(())
    }

    /// Move a task to `Blocked` and record why.
    pub(crate) fn block(&mut self, id: &TaskId, reason: BlockReason) -> Result<()> {
        self.transition(id, TaskStatus::Blocked)?;
        self.state.queue.remove(id);
        tracing::warn!("Task {id} blocked: {reason}");
        self.task_mut(id)?.blocked_reason = Some(reason);
        Ok(())
    }

    pub(crate) fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.state
            .tasks
            .get_mut(id)
            .ok_or_else(|| ForemanError::UnknownTask(id.clone()))
    }

    pub(crate) fn feature_mut(&mut self, id: FeatureId) -> Result<&mut Feature> {
        self.state
            .features
            .get_mut(&id)
            .ok_or(ForemanError::UnknownFeature(id))
    }

    pub(crate) fn set_touch_set(&mut self, id: &TaskId, touch_set: TouchSet) -> Result<()> {
        self.task_mut(id)?.touch_set = touch_set;
        Ok(())
    }

    /// Install a plan, archiving the one it supersedes.
    pub(crate) fn set_plan(&mut self, plan: Plan) {
        if let Some(previous) = self.state.plans.insert(plan.task_id.clone(), plan) {
            self.state.archived_plans.push(previous);
        }
    }

    /// Archive the current plan of a task without replacing it.
    pub(crate) fn retire_plan(&mut self, id: &TaskId) {
        if let Some(previous) = self.state.plans.remove(id) {
            self.state.archived_plans.push(previous);
        }
    }

    pub(crate) fn enqueue(&mut self, id: &TaskId, deadline: Option<Duration>) {
        self.state.queue.insert(
            id.clone(),
            CodeRequest {
                requested_at: Utc::now(),
                deadline_ms: deadline.map(|after| after.as_millis() as u64),
            },
        );
    }

    pub(crate) fn dequeue(&mut self, id: &TaskId) -> Option<CodeRequest> {
        self.state.queue.remove(id)
    }

    /// Advance a feature to `Done` once every task is `Done`. Returns whether it changed.
    pub(crate) fn refresh_feature(&mut self, id: FeatureId) -> Result<bool> {
        let all_done = {
            let tasks = self.tasks_of(id)?;
            !tasks.is_empty() && tasks.iter().all(|task| task.status == TaskStatus::Done)
        };
        let advanced = all_done && self.feature_mut(id)?.advance_to(FeatureStatus::Done);
        if advanced {
            tracing::info!("Feature {id} is done");
        }
        Ok(advanced)
    }

    /// Block every task left `InProgress` by a previous run.
    pub(crate) fn mark_interrupted(&mut self) -> Result<Vec<TaskId>> {
        let interrupted: Vec<TaskId> = self
            .tasks()
            .filter(|task| task.status == TaskStatus::InProgress)
            .map(|task| task.id.clone())
            .collect();
        for id in &interrupted {
            self.block(id, BlockReason::Interrupted)?;
        }
        Ok(interrupted)
    }
}
