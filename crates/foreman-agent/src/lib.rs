//! Coordination machinery for features and tasks.
//!
//! The [`Orchestrator`] is the single authority over task status. It owns the
//! [`FeatureStore`], the append-only [`HistoryLog`] and the [`LegacyArchive`], and
//! dispatches conflict-free batches of tasks to a bounded [`WorkerPool`].
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

/// Pre-overwrite snapshots and their revert procedure
pub mod archive;
/// Command-style surface with status codes
pub mod commands;
/// Dependency graph, conflict detection, claims, workspace and worker pool
pub mod executor;
/// Append-only changelog
pub mod history;
/// The coordinator
pub mod orchestrator;
/// On-disk project layout
pub mod project;
/// Features, tasks and plans
pub mod store;
/// Worker seam
pub mod worker;

pub use archive::{DirectorySink, LegacyArchive, MemorySink, SnapshotSink};
pub use commands::{Command, CommandOutcome, CommandStatus};
pub use executor::{
    BatchSelection, ConflictDetector, PoolEvent, ResourceClaims, TaskGraph, WorkerPool,
    WorkspaceState,
};
pub use history::HistoryLog;
pub use orchestrator::{Orchestrator, RunSummary, Verdict};
pub use project::Project;
pub use store::{CodeRequest, FeatureStore, ProjectState};
pub use worker::{CancelSignal, CommandWorker, TaskWorker, WorkAssignment, WorkOutput};
