use foreman_core::{ConflictReport, Exclusion, ResourceKey, Task, TaskId};
use std::collections::{BTreeMap, BTreeSet};

use super::claims::ResourceClaims;
use super::graph::TaskGraph;

/// Outcome of one admission round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSelection {
    /// Tasks that may start now, in admission order
    pub admitted: Vec<TaskId>,
    /// Tasks left out because their touch set overlaps an admitted or running task
    pub excluded: ConflictReport,
    /// Conflict-free tasks left out because the worker pool is full
    pub deferred: Vec<TaskId>,
}

/// Picks a concurrency-safe batch from the eligible tasks.
///
/// Candidates are ranked by dependency count (descending) and then by task id
/// (ascending). Each is admitted only if its touch set is disjoint from every key
/// already claimed, by running tasks or by tasks admitted earlier in the same round.
/// Exclusion never changes a task's rank, so a task that loses a round is first in
/// line once the conflicting task releases its keys.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    max_parallel: usize,
}

impl ConflictDetector {
    /// Create a detector that never admits more than `max_parallel` concurrent tasks
    pub fn new(max_parallel: usize) -> Self {
        Self { max_parallel }
    }

    /// Select the batch to dispatch this round.
    ///
    /// `running` is the number of tasks already in progress; their keys are read from `claims`.
    pub fn select(
        &self,
        candidates: &[&Task],
        graph: &TaskGraph,
        claims: &ResourceClaims,
        running: usize,
    ) -> BatchSelection {
        let mut ranked: Vec<&Task> = candidates.to_vec();
        ranked.sort_by(|left, right| {
            graph
                .dependency_count(&right.id)
                .cmp(&graph.dependency_count(&left.id))
                .then_with(|| left.id.cmp(&right.id))
        });

        let mut claimed: BTreeMap<ResourceKey, TaskId> = claims
            .claimed()
            .map(|(key, holder)| (key.clone(), holder.clone()))
            .collect();
        let free_slots = self.max_parallel.saturating_sub(running);
        let mut selection = BatchSelection::default();

        for task in ranked {
            if let Some(exclusion) = Self::overlap(task, &claimed) {
                tracing::debug!("Excluding {}: {}", task.id, exclusion.reason());
                selection.excluded.exclusions.push(exclusion);
                continue;
            }

            if selection.admitted.len() >= free_slots {
                selection.deferred.push(task.id.clone());
                continue;
            }

            for key in &task.touch_set {
                claimed.insert(key.clone(), task.id.clone());
            }
            selection.admitted.push(task.id.clone());
        }

        selection
            .excluded
            .exclusions
            .sort_by(|left, right| left.task.cmp(&right.task));
        selection
    }

    fn overlap(task: &Task, claimed: &BTreeMap<ResourceKey, TaskId>) -> Option<Exclusion> {
        let mut conflicts_with = BTreeSet::new();
        let mut keys = BTreeSet::new();

        for key in &task.touch_set {
            if let Some(holder) = claimed.get(key)
                && holder != &task.id
            {
                conflicts_with.insert(holder.clone());
                keys.insert(key.clone());
            }
        }

        (!keys.is_empty()).then(|| Exclusion {
            task: task.id.clone(),
            conflicts_with,
            keys,
        })
    }

    /// Pairwise overlap of `task` against `others`, ignoring tasks ordered with it by a
    /// dependency path (those can never run at the same time).
    pub fn overlap_with<'task>(
        task: &Task,
        others: impl IntoIterator<Item = &'task Task>,
        graph: &TaskGraph,
    ) -> Option<Exclusion> {
        let mut conflicts_with = BTreeSet::new();
        let mut keys = BTreeSet::new();

        for other in others {
            if other.id == task.id || graph.are_ordered(&task.id, &other.id) {
                continue;
            }
            let shared: Vec<&ResourceKey> = task.touch_set.intersection(&other.touch_set).collect();
            if !shared.is_empty() {
                conflicts_with.insert(other.id.clone());
                keys.extend(shared.into_iter().cloned());
            }
        }

        (!keys.is_empty()).then(|| Exclusion {
            task: task.id.clone(),
            conflicts_with,
            keys,
        })
    }
}
