//! Features and the PRD artifacts attached to them

use chrono::{DateTime, Utc};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::record::TaskId;
use crate::error::ForemanError;

/// Sequential feature identifier, displayed as `F<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(u64);

impl FeatureId {
    /// Wraps a raw sequence number.
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number.
    pub fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "F{}", self.0)
    }
}

impl FromStr for FeatureId {
    type Err = ForemanError;

    /// Accepts both `F3` and `3`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value.strip_prefix(['F', 'f']).unwrap_or(value);
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ForemanError::Other(format!("invalid feature id: {value}")))
    }
}

/// Sequential PRD identifier, displayed as `P<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrdId(u64);

impl PrdId {
    /// Wraps a raw sequence number.
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }
}

impl fmt::Display for PrdId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "P{}", self.0)
    }
}

/// Feature lifecycle status. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureStatus {
    /// Requested, no PRD yet
    Draft,
    /// At least one PRD attached
    Scoped,
    /// At least one task has been dispatched
    Active,
    /// Every task is done
    Done,
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "Draft",
            Self::Scoped => "Scoped",
            Self::Active => "Active",
            Self::Done => "Done",
        };
        formatter.write_str(label)
    }
}

/// A user-facing unit of scope, decomposed into tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Unique identifier
    pub id: FeatureId,
    /// Free-text description from the requesting role
    pub description: String,
    /// Current status
    pub status: FeatureStatus,
    /// Attached PRDs in attachment order
    pub prd_ids: Vec<PrdId>,
    /// Tasks belonging to this feature
    pub task_ids: BTreeSet<TaskId>,
    /// Archived features stay in the store but are hidden from listings
    #[serde(default)]
    pub archived: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Feature {
    /// Creates a `Draft` feature.
    pub fn new(id: FeatureId, description: String) -> Self {
        Self {
            id,
            description,
            status: FeatureStatus::Draft,
            prd_ids: Vec::new(),
            task_ids: BTreeSet::new(),
            archived: false,
            created_at: Utc::now(),
        }
    }

    /// Whether a PRD has been attached.
    pub fn has_prd(&self) -> bool {
        !self.prd_ids.is_empty()
    }

    /// Moves the status forward; never regresses.
    ///
    /// Returns `true` when the status changed.
    pub fn advance_to(&mut self, next: FeatureStatus) -> bool {
        if next > self.status {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Product requirements document attached to a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    /// Unique identifier
    pub id: PrdId,
    /// Feature this PRD scopes
    pub feature_id: FeatureId,
    /// Short title
    pub title: String,
    /// Document body, opaque to the coordinator
    pub body: String,
    /// When the PRD was attached
    pub attached_at: DateTime<Utc>,
}
