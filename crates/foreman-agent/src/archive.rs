//! Legacy archive: pre-overwrite snapshots with a revert procedure.

use chrono::{DateTime, TimeDelta, Utc};
use core::fmt::Debug;
use foreman_core::{
    ForemanError, LegacySnapshot, ResourceChange, ResourceKey, Result, RevertProcedure,
    SnapshotHandle,
};
use serde_json::{from_str, to_string_pretty};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::executor::WorkspaceState;

/// Durable storage for snapshots
pub trait SnapshotSink: Send + Sync + Debug {
    /// Persist one snapshot.
    ///
    /// # Errors
    /// Returns an error if the snapshot could not be made durable.
    fn persist(&self, snapshot: &LegacySnapshot) -> Result<()>;

    /// Every previously persisted snapshot.
    ///
    /// # Errors
    /// Returns an error if stored snapshots cannot be read.
    fn load_all(&self) -> Result<Vec<LegacySnapshot>>;
}

/// One JSON file per snapshot, named after its handle.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    directory: PathBuf,
}

impl DirectorySink {
    /// Store snapshots under `directory`
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    fn path_for(&self, handle: &SnapshotHandle) -> PathBuf {
        self.directory.join(format!("{handle}.json"))
    }
}

impl SnapshotSink for DirectorySink {
    fn persist(&self, snapshot: &LegacySnapshot) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        let path = self.path_for(&snapshot.handle);
        if path.exists() {
            return Err(ForemanError::Other(format!(
                "snapshot {} already exists",
                snapshot.handle
            )));
        }
        // Written aside and renamed so a torn write never leaves a partial `.json`.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, to_string_pretty(snapshot)?)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<LegacySnapshot>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                let contents = fs::read_to_string(&path)?;
                let snapshot: LegacySnapshot = from_str(&contents).map_err(|error| {
                    ForemanError::Other(format!(
                        "Failed to parse snapshot {}: {error}",
                        path.display()
                    ))
                })?;
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }
}

/// Keeps snapshots in memory only
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySink;

impl SnapshotSink for MemorySink {
    fn persist(&self, _snapshot: &LegacySnapshot) -> Result<()> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<LegacySnapshot>> {
        Ok(Vec::new())
    }
}

/// Snapshot store.
///
/// A snapshot is only handed out once its sink accepted it. Failed writes are retried
/// `retries` times before the snapshot is reported as a `SnapshotWriteFailure`.
#[derive(Debug)]
pub struct LegacyArchive {
    sink: Box<dyn SnapshotSink>,
    snapshots: BTreeMap<SnapshotHandle, LegacySnapshot>,
    retries: u32,
    last_timestamp: Option<DateTime<Utc>>,
}

impl LegacyArchive {
    /// Open an archive on `sink`, loading what it already holds.
    ///
    /// # Errors
    /// Returns an error if the sink cannot be read.
    pub fn open(sink: Box<dyn SnapshotSink>, retries: u32) -> Result<Self> {
        let snapshots: BTreeMap<SnapshotHandle, LegacySnapshot> = sink
            .load_all()?
            .into_iter()
            .map(|snapshot| (snapshot.handle.clone(), snapshot))
            .collect();
        let last_timestamp = snapshots.values().map(|snapshot| snapshot.timestamp).max();
        Ok(Self {
            sink,
            snapshots,
            retries,
            last_timestamp,
        })
    }

    /// Archive kept in memory only
    pub fn in_memory() -> Self {
        Self {
            sink: Box::new(MemorySink),
            snapshots: BTreeMap::new(),
            retries: 1,
            last_timestamp: None,
        }
    }

    /// Capture the current content of `key` before it is overwritten.
    ///
    /// # Errors
    /// Returns `SnapshotWriteFailure` if the sink rejects every attempt, or an error if
    /// the current content cannot be read.
    pub async fn snapshot(
        &mut self,
        workspace: &WorkspaceState,
        key: &ResourceKey,
        reason: impl Into<String>,
    ) -> Result<SnapshotHandle> {
        let prior = workspace.read(key).await?;
        let snapshot = LegacySnapshot::capture(self.next_timestamp(), key.clone(), prior, reason.into());

        let mut attempt = 0;
        loop {
            match self.sink.persist(&snapshot) {
                Ok(()) => break,
                Err(error) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Snapshot write for {key} failed ({error}), retry {attempt}/{}",
                        self.retries
                    );
                }
                Err(error) => {
                    tracing::error!("Snapshot write for {key} failed permanently: {error}");
                    return Err(ForemanError::SnapshotWriteFailure {
                        resource: key.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        let handle = snapshot.handle.clone();
        self.last_timestamp = Some(snapshot.timestamp);
        self.snapshots.insert(handle.clone(), snapshot);
        tracing::debug!("Archived {key} as {handle}");
        Ok(handle)
    }

    /// Timestamps are strictly increasing so handles never collide.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_timestamp {
            Some(last) if last >= now => last + TimeDelta::microseconds(1),
            _ => now,
        }
    }

    /// The change that restores the resource captured by `handle`.
    ///
    /// # Errors
    /// Returns `UnknownSnapshot` if no such snapshot exists.
    pub fn revert_change(&self, handle: &SnapshotHandle) -> Result<ResourceChange> {
        let snapshot = self.get(handle)?;
        let key = snapshot.resource_key.clone();
        match (&snapshot.revert_procedure, &snapshot.prior_content) {
            (RevertProcedure::RestoreContent, Some(content)) => Ok(ResourceChange::Modify {
                key,
                content: content.clone(),
            }),
            (RevertProcedure::DeleteResource, _) | (RevertProcedure::RestoreContent, None) => {
                Ok(ResourceChange::Delete { key })
            }
        }
    }

    /// Look up a snapshot.
    ///
    /// # Errors
    /// Returns `UnknownSnapshot` if absent.
    pub fn get(&self, handle: &SnapshotHandle) -> Result<&LegacySnapshot> {
        self.snapshots
            .get(handle)
            .ok_or_else(|| ForemanError::UnknownSnapshot(handle.clone()))
    }

    /// All snapshots, oldest first
    pub fn list(&self) -> Vec<&LegacySnapshot> {
        let mut snapshots: Vec<&LegacySnapshot> = self.snapshots.values().collect();
        snapshots.sort_by(|left, right| left.timestamp.cmp(&right.timestamp));
        snapshots
    }

    /// Snapshots of one resource, oldest first
    pub fn for_resource(&self, key: &ResourceKey) -> Vec<&LegacySnapshot> {
        self.list()
            .into_iter()
            .filter(|snapshot| &snapshot.resource_key == key)
            .collect()
    }

    /// Number of snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshot was taken yet
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
