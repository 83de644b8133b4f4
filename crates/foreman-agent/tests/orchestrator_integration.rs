//! Integration tests for `Orchestrator`.
//!
//! Drives features and tasks through planning, conflict-aware dispatch, completion,
//! validation and recovery with an in-process worker.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::too_many_lines,
        reason = "Test allows"
    )
)]

use async_trait::async_trait;
use core::time::Duration;
use foreman_agent::{
    CancelSignal, FeatureStore, HistoryLog, LegacyArchive, Orchestrator, SnapshotSink, TaskWorker,
    Verdict, WorkAssignment, WorkOutput, WorkspaceState,
};
use foreman_core::{
    BlockReason, Content, ExecutionConfig, FeatureId, FeatureStatus, ForemanError, ImpactMatrix,
    LegacySnapshot, ResourceChange, ResourceKey, Result, TaskId, TaskSpec, TaskStatus, TouchSet,
};
use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tokio::time::sleep;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("foreman_agent=debug")
            .init();
    });
}

/// Writes its task id into every touched resource.
///
/// Descriptions steer it: `fail` reports an error, `hang` waits for cancellation,
/// `stubborn` ignores cancellation for a while, `stray` also writes outside the
/// touch set.
#[derive(Default)]
struct ScriptedWorker {
    live: Mutex<Vec<(TaskId, TouchSet)>>,
    overlaps: Mutex<Vec<(TaskId, TaskId)>>,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    fn enter(&self, assignment: &WorkAssignment) {
        let mut live = self.live.lock().unwrap();
        for (other, keys) in live.iter() {
            if !keys.is_disjoint(&assignment.touch_set) {
                self.overlaps
                    .lock()
                    .unwrap()
                    .push((assignment.task_id.clone(), other.clone()));
            }
        }
        live.push((assignment.task_id.clone(), assignment.touch_set.clone()));
        self.peak.fetch_max(live.len(), Ordering::SeqCst);
    }

    fn leave(&self, task: &TaskId) {
        self.live.lock().unwrap().retain(|(id, _)| id != task);
    }
}

#[async_trait]
impl TaskWorker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn perform(&self, assignment: WorkAssignment, mut cancel: CancelSignal) -> Result<WorkOutput> {
        self.enter(&assignment);
        let task = assignment.task_id.clone();

        if assignment.description.contains("stubborn") {
            sleep(Duration::from_millis(100)).await;
            self.leave(&task);
            return Err(ForemanError::Other("gave up".to_owned()));
        }
        if assignment.description.contains("hang") {
            cancel.cancelled().await;
            self.leave(&task);
            return Err(ForemanError::Other("cancelled".to_owned()));
        }
        sleep(Duration::from_millis(15)).await;
        self.leave(&task);

        if assignment.description.contains("fail") {
            return Err(ForemanError::Other("compiler error".to_owned()));
        }

        let mut changes: Vec<ResourceChange> = assignment
            .touch_set
            .iter()
            .map(|key| ResourceChange::Modify {
                key: key.clone(),
                content: format!("written by {task}").into(),
            })
            .collect();
        if assignment.description.contains("stray") {
            changes.push(ResourceChange::Create {
                key: ResourceKey::new("stray.txt"),
                content: Content::default(),
            });
        }
        let mut output = WorkOutput::with_changes(changes);
        output.summary = format!("{task}: {}", assignment.description);
        Ok(output)
    }
}

/// Returns the same changes for every task.
struct FixedWorker {
    changes: Vec<ResourceChange>,
}

#[async_trait]
impl TaskWorker for FixedWorker {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn perform(&self, _assignment: WorkAssignment, _cancel: CancelSignal) -> Result<WorkOutput> {
        Ok(WorkOutput::with_changes(self.changes.clone()))
    }
}

/// Rejects every write.
#[derive(Debug)]
struct BrokenSink;

impl SnapshotSink for BrokenSink {
    fn persist(&self, _snapshot: &LegacySnapshot) -> Result<()> {
        Err(ForemanError::Other("read-only file system".to_owned()))
    }

    fn load_all(&self) -> Result<Vec<LegacySnapshot>> {
        Ok(Vec::new())
    }
}

fn orchestrator(execution: ExecutionConfig) -> (Orchestrator, Arc<ScriptedWorker>) {
    init_tracing();
    let worker = Arc::new(ScriptedWorker::default());
    let orchestrator = Orchestrator::in_memory(execution)
        .with_worker(Arc::clone(&worker) as Arc<dyn TaskWorker>)
        .with_roles(["implementation-lead".to_owned()]);
    (orchestrator, worker)
}

fn on_disk(
    root: &TempDir,
    history: HistoryLog,
    worker: Arc<dyn TaskWorker>,
) -> Orchestrator {
    init_tracing();
    Orchestrator::new(
        ExecutionConfig::default(),
        FeatureStore::new(),
        history,
        LegacyArchive::in_memory(),
        WorkspaceState::new(root.path().to_path_buf()),
    )
    .unwrap()
    .with_worker(worker)
}

fn scoped_feature(orchestrator: &mut Orchestrator, specs: Vec<TaskSpec>) -> FeatureId {
    let feature = orchestrator.create_feature("user accounts");
    orchestrator
        .attach_prd(feature, "Accounts", "Sign-up and login")
        .unwrap();
    orchestrator.create_tasks(feature, specs).unwrap();
    feature
}

fn matrix(keys: &[&str]) -> ImpactMatrix {
    keys.iter()
        .map(|key| (ResourceKey::new(*key), "edit".to_owned()))
        .collect()
}

fn plan_and_queue(orchestrator: &mut Orchestrator, task: &str, keys: &[&str]) {
    let id = TaskId::new(task);
    orchestrator.plan(&id, matrix(keys), Vec::new()).unwrap();
    orchestrator.request_code(&id, None).unwrap();
}

fn status(orchestrator: &Orchestrator, task: &str) -> TaskStatus {
    orchestrator.store().status(&TaskId::new(task)).unwrap()
}

fn reason(orchestrator: &Orchestrator, task: &str) -> Option<BlockReason> {
    orchestrator
        .store()
        .task(&TaskId::new(task))
        .unwrap()
        .blocked_reason
        .clone()
}

#[tokio::test]
async fn test_overlapping_tasks_are_serialized() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    let feature = scoped_feature(
        &mut orchestrator,
        vec![
            TaskSpec::new("T1", "create form")
                .with_criteria(["renders", "validates", "submits"])
                .with_touch_set(["a.txt"]),
            TaskSpec::new("T2", "style form").with_touch_set(["a.txt"]),
        ],
    );
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);
    plan_and_queue(&mut orchestrator, "T2", &["a.txt"]);
    assert_eq!(orchestrator.eligible_tasks(Some(feature)).len(), 2);

    let notes = &orchestrator
        .store()
        .plan(&TaskId::new("T2"))
        .unwrap()
        .duplicate_risk_notes;
    assert_eq!(notes, &vec!["conflicts with T1 on a.txt".to_owned()]);

    let first = orchestrator.dispatch_ready().await.unwrap();
    assert_eq!(first.admitted, vec![TaskId::new("T1")]);
    let exclusion = first.excluded.exclusion_for(&TaskId::new("T2")).unwrap();
    assert_eq!(exclusion.reason(), "conflicts with T1");
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::InProgress);
    assert_eq!(
        orchestrator.store().feature(feature).unwrap().status,
        FeatureStatus::Active
    );

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(
        summary.implemented,
        vec![TaskId::new("T1"), TaskId::new("T2")]
    );
    assert_eq!(summary.dispatched, vec![TaskId::new("T2")]);
    assert!(orchestrator.claims().is_empty());

    let key = ResourceKey::new("a.txt");
    assert_eq!(
        orchestrator.workspace().read(&key).await.unwrap(),
        Some(Content::from("written by T2"))
    );
    let entries = orchestrator.history().for_resource(&key);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].task_id, Some(TaskId::new("T1")));
    assert_eq!(
        entries[0].agent_roles,
        BTreeSet::from(["implementation-lead".to_owned()])
    );
    assert_eq!(orchestrator.archive().for_resource(&key).len(), 2);
}

#[tokio::test]
async fn test_concurrent_tasks_have_disjoint_touch_sets() {
    let (mut orchestrator, worker) = orchestrator(ExecutionConfig {
        max_parallel_workers: 4,
        ..ExecutionConfig::default()
    });
    let layout: [(&str, &[&str]); 6] = [
        ("T1", &["a", "b"]),
        ("T2", &["b", "c"]),
        ("T3", &["c", "d"]),
        ("T4", &["d", "e"]),
        ("T5", &["e", "a"]),
        ("T6", &["f"]),
    ];
    scoped_feature(
        &mut orchestrator,
        layout
            .iter()
            .map(|(id, _)| TaskSpec::new(*id, "edit"))
            .collect(),
    );
    for (id, keys) in layout {
        plan_and_queue(&mut orchestrator, id, keys);
    }

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(summary.implemented.len(), 6);
    assert!(worker.overlaps.lock().unwrap().is_empty());
    assert!(worker.peak.load(Ordering::SeqCst) > 1);
    assert!(worker.peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn test_capacity_bounds_running_workers() {
    let (mut orchestrator, worker) = orchestrator(ExecutionConfig {
        max_parallel_workers: 2,
        ..ExecutionConfig::default()
    });
    let ids = ["T1", "T2", "T3", "T4", "T5"];
    scoped_feature(
        &mut orchestrator,
        ids.iter().map(|id| TaskSpec::new(*id, "edit")).collect(),
    );
    for id in ids {
        let key = format!("{id}.txt");
        plan_and_queue(&mut orchestrator, id, &[key.as_str()]);
    }

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(summary.implemented.len(), 5);
    assert!(worker.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_cycle_is_rejected_without_persisting() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    let feature = orchestrator.create_feature("reports");

    let error = orchestrator
        .create_tasks(
            feature,
            vec![
                TaskSpec::new("T3", "aggregate").with_dependencies(["T4"]),
                TaskSpec::new("T4", "collect").with_dependencies(["T3"]),
            ],
        )
        .unwrap_err();
    assert!(matches!(error, ForemanError::CycleDetected { .. }));
    assert_eq!(orchestrator.store().tasks().count(), 0);

    orchestrator
        .create_tasks(
            feature,
            vec![
                TaskSpec::new("T4", "collect"),
                TaskSpec::new("T3", "aggregate").with_dependencies(["T4"]),
            ],
        )
        .unwrap();
    let late = orchestrator
        .add_dependency(&TaskId::new("T4"), &TaskId::new("T3"))
        .unwrap_err();
    assert!(matches!(late, ForemanError::CycleDetected { .. }));
    assert!(orchestrator
        .store()
        .graph()
        .dependencies(&TaskId::new("T4"))
        .is_empty());
}

#[tokio::test]
async fn test_worker_failure_releases_claims() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(
        &mut orchestrator,
        vec![
            TaskSpec::new("T6", "fail on purpose"),
            TaskSpec::new("T7", "retry the same file"),
        ],
    );
    plan_and_queue(&mut orchestrator, "T6", &["b.txt"]);
    plan_and_queue(&mut orchestrator, "T7", &["b.txt"]);

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(status(&orchestrator, "T6"), TaskStatus::Blocked);
    assert_eq!(
        reason(&orchestrator, "T6"),
        Some(BlockReason::WorkerFailed {
            message: "compiler error".to_owned()
        })
    );
    assert_eq!(summary.implemented, vec![TaskId::new("T7")]);
    assert!(orchestrator.claims().is_empty());
    assert!(orchestrator
        .history()
        .entries()
        .iter()
        .all(|entry| entry.task_id != Some(TaskId::new("T6"))));
}

#[tokio::test]
async fn test_deadline_blocks_task() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "hang forever")]);
    let id = TaskId::new("T1");
    orchestrator.plan(&id, matrix(&["a.txt"]), Vec::new()).unwrap();
    orchestrator
        .request_code(&id, Some(Duration::from_millis(30)))
        .unwrap();

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(
        summary.blocked.get(&id),
        Some(&BlockReason::Timeout { after_ms: 30 })
    );
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Blocked);
    assert!(orchestrator.claims().is_empty());
    assert!(orchestrator.history().is_empty());
}

#[tokio::test]
async fn test_undeclared_change_blocks_task() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "stray write")]);
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);

    orchestrator.run_until_idle().await.unwrap();
    assert_eq!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::UndeclaredResource {
            keys: BTreeSet::from([ResourceKey::new("stray.txt")])
        })
    );
    assert!(orchestrator
        .workspace()
        .read(&ResourceKey::new("a.txt"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_snapshot_failure_halts_until_resumed() {
    init_tracing();
    let worker = Arc::new(ScriptedWorker::default());
    let mut orchestrator = Orchestrator::new(
        ExecutionConfig::default(),
        FeatureStore::new(),
        HistoryLog::in_memory(),
        LegacyArchive::open(Box::new(BrokenSink), 1).unwrap(),
        WorkspaceState::in_memory(),
    )
    .unwrap()
    .with_worker(worker);
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "edit")]);
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);

    let error = orchestrator.run_until_idle().await.unwrap_err();
    assert!(matches!(error, ForemanError::SnapshotWriteFailure { .. }));
    assert!(matches!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::SnapshotWriteFailure { .. })
    ));
    assert!(orchestrator.halt_reason().is_some());
    assert!(orchestrator.history().is_empty());
    assert!(orchestrator
        .workspace()
        .read(&ResourceKey::new("a.txt"))
        .await
        .unwrap()
        .is_none());

    let halted = orchestrator.dispatch_ready().await.unwrap_err();
    assert!(matches!(halted, ForemanError::Halted(_)));

    assert!(orchestrator.resume());
    assert!(!orchestrator.resume());
    assert!(orchestrator.dispatch_ready().await.unwrap().admitted.is_empty());
}

#[test]
fn test_revert_restores_content_with_one_entry() {
    tokio_test::block_on(async {
        let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
        let key = ResourceKey::new("notes.md");
        orchestrator
            .workspace()
            .apply_changes(&[ResourceChange::Create {
                key: key.clone(),
                content: "original\n".into(),
            }])
            .await
            .unwrap();

        let handle = orchestrator.snapshot(&key, "test").await.unwrap();
        orchestrator
            .workspace()
            .apply_changes(&[ResourceChange::Modify {
                key: key.clone(),
                content: "rewritten\n".into(),
            }])
            .await
            .unwrap();

        let before = orchestrator.history().len();
        let entry = orchestrator.revert_to(&handle).await.unwrap();
        assert_eq!(orchestrator.history().len(), before + 1);
        assert_eq!(entry.resource_keys, BTreeSet::from([key.clone()]));
        assert_eq!(
            orchestrator.workspace().read(&key).await.unwrap(),
            Some(Content::from("original\n"))
        );

        // The overwritten content was archived too, so the revert itself can be undone.
        let latest = orchestrator.archive().for_resource(&key);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].prior_content, Some(Content::from("rewritten\n")));
    });
}

#[tokio::test]
async fn test_revert_of_claimed_resource_is_refused() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "hang")]);
    let key = ResourceKey::new("a.txt");
    let handle = orchestrator.snapshot(&key, "before").await.unwrap();
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);
    orchestrator.dispatch_ready().await.unwrap();

    let error = orchestrator.revert_to(&handle).await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "resource a.txt is claimed by running task T1"
    );
    assert!(orchestrator.history().is_empty());
}

#[tokio::test]
async fn test_strict_replan_regresses_to_draft() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig {
        strict_planning: true,
        ..ExecutionConfig::default()
    });
    scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "api"), TaskSpec::new("T2", "ui")],
    );
    let second = TaskId::new("T2");
    orchestrator
        .plan(&TaskId::new("T1"), matrix(&["api.rs"]), Vec::new())
        .unwrap();
    orchestrator.plan(&second, matrix(&["ui.rs"]), Vec::new()).unwrap();

    let error = orchestrator
        .plan(&second, matrix(&["ui.rs", "api.rs"]), Vec::new())
        .unwrap_err();
    assert!(matches!(error, ForemanError::ConflictDetected(_)));
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Draft);
    assert!(orchestrator.store().plan(&second).is_none());
    assert_eq!(orchestrator.store().archived_plans().len(), 1);
}

#[tokio::test]
async fn test_ordered_tasks_may_share_resources() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig {
        strict_planning: true,
        ..ExecutionConfig::default()
    });
    scoped_feature(
        &mut orchestrator,
        vec![
            TaskSpec::new("T1", "schema"),
            TaskSpec::new("T2", "migration").with_dependencies(["T1"]),
        ],
    );
    plan_and_queue(&mut orchestrator, "T1", &["db.sql"]);
    plan_and_queue(&mut orchestrator, "T2", &["db.sql"]);

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(summary.implemented, vec![TaskId::new("T1")]);
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Planned);

    orchestrator
        .record_verdict(&TaskId::new("T1"), Verdict::Approved)
        .unwrap();
    let next = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(next.implemented, vec![TaskId::new("T2")]);
}

#[tokio::test]
async fn test_revised_touch_set_conflict_blocks_reviser() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    let feature = scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "hang"), TaskSpec::new("T2", "docs")],
    );
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);
    orchestrator
        .plan(&TaskId::new("T2"), matrix(&["b.txt"]), Vec::new())
        .unwrap();
    orchestrator.dispatch_ready().await.unwrap();

    let exclusion = orchestrator
        .revise_touch_set(&TaskId::new("T2"), BTreeSet::from([ResourceKey::new("a.txt")]))
        .unwrap()
        .unwrap();
    assert_eq!(exclusion.reason(), "conflicts with T1");
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Blocked);
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::InProgress);
    assert_eq!(
        orchestrator.claims().holder(&ResourceKey::new("a.txt")),
        Some(&TaskId::new("T1"))
    );

    let cancelled = orchestrator.cancel_feature(feature).unwrap();
    assert_eq!(cancelled, vec![TaskId::new("T1")]);
    assert_eq!(reason(&orchestrator, "T1"), Some(BlockReason::Cancelled));
    assert!(orchestrator.claims().is_empty());
    assert!(orchestrator.run_until_idle().await.unwrap().implemented.is_empty());

    orchestrator.archive_feature(feature).unwrap();
    let refused = orchestrator
        .create_tasks(feature, vec![TaskSpec::new("T3", "late")])
        .unwrap_err();
    assert!(matches!(refused, ForemanError::Other(_)));
}

#[tokio::test]
async fn test_dependency_added_mid_flight_blocks_task() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T0", "prerequisite"), TaskSpec::new("T1", "hang")],
    );
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);
    orchestrator.dispatch_ready().await.unwrap();

    orchestrator
        .add_dependency(&TaskId::new("T1"), &TaskId::new("T0"))
        .unwrap();
    assert_eq!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::UnmetDependency {
            dependency: TaskId::new("T0")
        })
    );
    assert!(orchestrator.claims().is_empty());

    orchestrator
        .plan(&TaskId::new("T1"), matrix(&["a.txt"]), Vec::new())
        .unwrap();
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Planned);
    assert!(orchestrator.eligible_tasks(None).iter().all(|task| task.id != TaskId::new("T1")));
}

#[tokio::test]
async fn test_verdicts_complete_feature() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    let feature = scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "one"), TaskSpec::new("T2", "two")],
    );
    plan_and_queue(&mut orchestrator, "T1", &["one.txt"]);
    plan_and_queue(&mut orchestrator, "T2", &["two.txt"]);
    orchestrator.run_until_idle().await.unwrap();

    let rejected = orchestrator
        .record_verdict(&TaskId::new("T2"), Verdict::Rejected("missing tests".to_owned()))
        .unwrap();
    assert_eq!(rejected, TaskStatus::Blocked);

    let approved = orchestrator
        .record_verdict(&TaskId::new("T1"), Verdict::Approved)
        .unwrap();
    assert_eq!(approved, TaskStatus::Done);
    assert_eq!(
        orchestrator.store().feature(feature).unwrap().status,
        FeatureStatus::Active
    );

    plan_and_queue(&mut orchestrator, "T2", &["two.txt"]);
    orchestrator.run_until_idle().await.unwrap();
    orchestrator
        .record_verdict(&TaskId::new("T2"), Verdict::Approved)
        .unwrap();
    assert_eq!(
        orchestrator.store().feature(feature).unwrap().status,
        FeatureStatus::Done
    );

    let again = orchestrator
        .record_verdict(&TaskId::new("T2"), Verdict::Approved)
        .unwrap_err();
    assert!(matches!(again, ForemanError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_eligible_tasks_is_stable() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    scoped_feature(
        &mut orchestrator,
        vec![
            TaskSpec::new("T1", "base"),
            TaskSpec::new("T2", "top").with_dependencies(["T1"]),
            TaskSpec::new("T3", "side"),
        ],
    );

    let first: Vec<TaskId> = orchestrator
        .eligible_tasks(None)
        .iter()
        .map(|task| task.id.clone())
        .collect();
    let second: Vec<TaskId> = orchestrator
        .eligible_tasks(None)
        .iter()
        .map(|task| task.id.clone())
        .collect();
    assert_eq!(first, second);
    assert_eq!(first, vec![TaskId::new("T1"), TaskId::new("T3")]);
}

#[tokio::test]
async fn test_queued_task_without_worker_is_reported() {
    init_tracing();
    let mut orchestrator = Orchestrator::in_memory(ExecutionConfig::default());
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "edit")]);
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);

    let error = orchestrator.dispatch_ready().await.unwrap_err();
    assert!(matches!(error, ForemanError::Config(_)));
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Planned);
}

#[tokio::test]
async fn test_failed_change_leaves_workspace_untouched() {
    let root = TempDir::new().expect("create temp dir");
    fs::write(root.path().join("kept.txt"), "OLD").unwrap();
    let worker = Arc::new(FixedWorker {
        changes: vec![
            ResourceChange::Modify {
                key: ResourceKey::new("kept.txt"),
                content: "NEW".into(),
            },
            ResourceChange::Create {
                key: ResourceKey::new("x.txt"),
                content: "file".into(),
            },
            ResourceChange::Create {
                key: ResourceKey::new("x.txt/y"),
                content: "nested".into(),
            },
        ],
    });
    let mut orchestrator = on_disk(&root, HistoryLog::in_memory(), worker);
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "edit")]);
    plan_and_queue(&mut orchestrator, "T1", &["kept.txt", "x.txt", "x.txt/y"]);

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert!(summary.implemented.is_empty());
    assert!(matches!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::WorkerFailed { message }) if message.starts_with("failed to apply changes")
    ));
    assert_eq!(fs::read_to_string(root.path().join("kept.txt")).unwrap(), "OLD");
    assert!(!root.path().join("x.txt").exists());
    assert!(orchestrator.history().is_empty());
    assert!(orchestrator.claims().is_empty());
    assert!(orchestrator.halt_reason().is_none());
}

#[tokio::test]
async fn test_changelog_failure_undoes_changes() {
    let root = TempDir::new().expect("create temp dir");
    fs::write(root.path().join("a.txt"), "OLD").unwrap();
    let log_path = root.path().join("state").join("changelog.jsonl");
    let history = HistoryLog::open(log_path.clone()).unwrap();
    fs::create_dir_all(&log_path).unwrap();
    let worker = Arc::new(ScriptedWorker::default());
    let mut orchestrator = on_disk(&root, history, worker);
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "edit")]);
    plan_and_queue(&mut orchestrator, "T1", &["a.txt"]);

    orchestrator.run_until_idle().await.unwrap_err();
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Blocked);
    assert!(matches!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::HistoryWriteFailure { .. })
    ));
    assert_eq!(fs::read_to_string(root.path().join("a.txt")).unwrap(), "OLD");
    assert!(orchestrator.history().is_empty());
    assert!(orchestrator.halt_reason().is_some());
}

#[tokio::test]
async fn test_binary_resource_dispatches_and_reverts() {
    let root = TempDir::new().expect("create temp dir");
    let original: [u8; 6] = [0x89, 0x50, 0x4e, 0x47, 0xff, 0x00];
    fs::write(root.path().join("logo.png"), original).unwrap();
    let worker = Arc::new(ScriptedWorker::default());
    let mut orchestrator = on_disk(&root, HistoryLog::in_memory(), worker);
    scoped_feature(&mut orchestrator, vec![TaskSpec::new("T1", "redraw logo")]);
    plan_and_queue(&mut orchestrator, "T1", &["logo.png"]);

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(summary.implemented, vec![TaskId::new("T1")]);
    assert_eq!(
        fs::read_to_string(root.path().join("logo.png")).unwrap(),
        "written by T1"
    );

    let key = ResourceKey::new("logo.png");
    let handle = orchestrator.archive().for_resource(&key)[0].handle.clone();
    orchestrator.revert_to(&handle).await.unwrap();
    assert_eq!(fs::read(root.path().join("logo.png")).unwrap(), original);
}

#[tokio::test]
async fn test_unstartable_task_is_blocked_alone() {
    let root = TempDir::new().expect("create temp dir");
    let worker = Arc::new(ScriptedWorker::default());
    let mut orchestrator = on_disk(&root, HistoryLog::in_memory(), worker);
    scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "escape"), TaskSpec::new("T2", "edit")],
    );
    plan_and_queue(&mut orchestrator, "T1", &["../outside.txt"]);
    plan_and_queue(&mut orchestrator, "T2", &["inside.txt"]);

    let first = orchestrator.dispatch_ready().await.unwrap();
    assert_eq!(first.admitted, vec![TaskId::new("T2")]);
    assert!(matches!(
        reason(&orchestrator, "T1"),
        Some(BlockReason::WorkerFailed { message }) if message.starts_with("failed to start")
    ));

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(summary.implemented, vec![TaskId::new("T2")]);
    assert!(orchestrator.claims().is_empty());
}

#[tokio::test]
async fn test_worker_ignoring_cancellation_keeps_its_slot() {
    let (mut orchestrator, worker) = orchestrator(ExecutionConfig {
        max_parallel_workers: 1,
        ..ExecutionConfig::default()
    });
    scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "stubborn"), TaskSpec::new("T2", "edit")],
    );
    let first = TaskId::new("T1");
    orchestrator.plan(&first, matrix(&["a.txt"]), Vec::new()).unwrap();
    orchestrator
        .request_code(&first, Some(Duration::from_millis(20)))
        .unwrap();
    plan_and_queue(&mut orchestrator, "T2", &["b.txt"]);

    let summary = orchestrator.run_until_idle().await.unwrap();
    assert_eq!(
        summary.blocked.get(&first),
        Some(&BlockReason::Timeout { after_ms: 20 })
    );
    assert_eq!(summary.implemented, vec![TaskId::new("T2")]);
    assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_task_needs_prd_to_replan() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig::default());
    let feature = orchestrator.create_feature("unscoped");
    orchestrator
        .create_tasks(feature, vec![TaskSpec::new("T1", "draft")])
        .unwrap();
    orchestrator.cancel_feature(feature).unwrap();

    let error = orchestrator
        .plan(&TaskId::new("T1"), matrix(&["a.txt"]), Vec::new())
        .unwrap_err();
    assert!(matches!(error, ForemanError::InvalidTransition { .. }));
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Blocked);

    orchestrator.attach_prd(feature, "Scope", "").unwrap();
    orchestrator
        .plan(&TaskId::new("T1"), matrix(&["a.txt"]), Vec::new())
        .unwrap();
    assert_eq!(status(&orchestrator, "T1"), TaskStatus::Planned);
}

#[tokio::test]
async fn test_strict_rejection_keeps_draft_status() {
    let (mut orchestrator, _worker) = orchestrator(ExecutionConfig {
        strict_planning: true,
        ..ExecutionConfig::default()
    });
    scoped_feature(
        &mut orchestrator,
        vec![TaskSpec::new("T1", "api"), TaskSpec::new("T2", "ui")],
    );
    let second = TaskId::new("T2");
    orchestrator
        .plan(&TaskId::new("T1"), matrix(&["api.rs"]), Vec::new())
        .unwrap();
    orchestrator.plan(&second, matrix(&["ui.rs"]), Vec::new()).unwrap();
    orchestrator
        .plan(&second, matrix(&["api.rs"]), Vec::new())
        .unwrap_err();
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Draft);

    let again = orchestrator
        .plan(&second, matrix(&["api.rs"]), Vec::new())
        .unwrap_err();
    assert!(matches!(again, ForemanError::ConflictDetected(_)));
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Draft);

    orchestrator.plan(&second, matrix(&["ui.rs"]), Vec::new()).unwrap();
    assert_eq!(status(&orchestrator, "T2"), TaskStatus::Planned);
}
