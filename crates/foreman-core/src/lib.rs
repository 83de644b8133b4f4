//! Core types for the feature/task coordination protocol.
//!
//! This crate provides the data model (features, tasks, plans, changelog entries,
//! legacy snapshots), the task status state machine, error handling and
//! configuration shared by the coordinator and its front ends.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        reason = "Allow for tests"
    )
)]

/// Configuration loading and defaults.
pub mod config;
/// Touch-set conflict reports.
pub mod conflict;
/// Error types and result definitions.
pub mod error;
/// Changelog entries and legacy snapshots.
pub mod history;
/// Features, tasks, plans and resource changes.
pub mod task;

pub use config::{
    ExecutionConfig, ForemanConfig, STATE_DIR_NAME, StorageConfig, WorkerConfig, WorkspaceConfig,
};
pub use conflict::{ConflictReport, Exclusion};
pub use error::{ErrorClass, ForemanError, Result};
pub use history::{
    ChangeRecord, ChangeType, ChangelogEntry, LegacySnapshot, RevertProcedure, SnapshotHandle,
};
pub use task::{
    BlockReason, Content, Feature, FeatureId, FeatureStatus, ImpactMatrix, MAX_ACCEPTANCE_CRITERIA, Plan,
    Prd, PrdId, ResourceChange, ResourceKey, Task, TaskId, TaskSpec, TaskStatus, TouchSet,
};
