//! Implementation plans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::record::{ResourceKey, TaskId, TouchSet};

/// Resource key to a description of the change planned for it.
pub type ImpactMatrix = BTreeMap<ResourceKey, String>;

/// A task's declared impact prior to execution. One current plan per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Task this plan belongs to
    pub task_id: TaskId,
    /// Planned change per resource
    pub impact_matrix: ImpactMatrix,
    /// Overlaps with other plans found when this plan was made
    pub duplicate_risk_notes: Vec<String>,
    /// When the plan was made
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Creates a plan with no risk notes.
    pub fn new(task_id: TaskId, impact_matrix: ImpactMatrix) -> Self {
        Self {
            task_id,
            impact_matrix,
            duplicate_risk_notes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Resources named in the impact matrix.
    pub fn touch_set(&self) -> TouchSet {
        self.impact_matrix.keys().cloned().collect()
    }
}
