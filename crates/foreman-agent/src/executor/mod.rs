//! Scheduling machinery driven by the orchestrator.
//!
//! This module provides the task dependency graph, touch-set conflict detection,
//! resource-key claims, the tracked workspace with its transactions, and the bounded
//! worker pool.

/// Resource-key claims held by in-progress tasks
pub mod claims;
/// Task dependency graph
pub mod graph;
/// Bounded pool of concurrent workers
pub mod pool;
/// Conflict-aware batch selection
pub mod scheduler;
/// Tracked resources and snapshots of their content
pub mod state;
/// All-or-nothing application of resource changes
pub mod transaction;

pub use claims::ResourceClaims;
pub use graph::TaskGraph;
pub use pool::{DEFAULT_DRAIN_GRACE, DispatchId, PoolEvent, WorkerPool, WorkerReport};
pub use scheduler::{BatchSelection, ConflictDetector};
pub use state::{WorkspaceSnapshot, WorkspaceState};
pub use transaction::Transaction;
