//! Touch-set conflict reports

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::task::{ResourceKey, TaskId};

/// A task that could not be admitted because its touch set overlaps others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    /// Excluded task
    pub task: TaskId,
    /// Tasks that already claim the overlapping keys
    pub conflicts_with: BTreeSet<TaskId>,
    /// Overlapping keys
    pub keys: BTreeSet<ResourceKey>,
}

impl Exclusion {
    /// Human-readable reason, e.g. `conflicts with T1`.
    pub fn reason(&self) -> String {
        let holders: Vec<&str> = self.conflicts_with.iter().map(TaskId::as_str).collect();
        format!("conflicts with {}", holders.join(", "))
    }
}

/// Every exclusion found while checking a set of tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// One entry per excluded task, ordered by task id
    pub exclusions: Vec<Exclusion>,
}

impl ConflictReport {
    /// Report with a single exclusion.
    pub fn single(exclusion: Exclusion) -> Self {
        Self {
            exclusions: vec![exclusion],
        }
    }

    /// Whether no conflicts were found.
    pub fn is_empty(&self) -> bool {
        self.exclusions.is_empty()
    }

    /// Exclusion recorded for `task`, if any.
    pub fn exclusion_for(&self, task: &TaskId) -> Option<&Exclusion> {
        self.exclusions
            .iter()
            .find(|exclusion| &exclusion.task == task)
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .exclusions
            .iter()
            .map(|exclusion| format!("{} {}", exclusion.task, exclusion.reason()))
            .collect();
        formatter.write_str(&lines.join("; "))
    }
}
