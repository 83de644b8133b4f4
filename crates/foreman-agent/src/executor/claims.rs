use foreman_core::{ConflictReport, Exclusion, ForemanError, ResourceKey, Result, TaskId, TouchSet};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tracks which resource keys are claimed by which in-progress task.
///
/// Only the coordinator touches this, so claims are plain bookkeeping rather than
/// runtime locks: a key is claimed when its task is dispatched and released when the
/// task completes, fails, times out or is cancelled.
#[derive(Debug, Default)]
pub struct ResourceClaims {
    holders: BTreeMap<ResourceKey, TaskId>,
    by_task: HashMap<TaskId, TouchSet>,
}

impl ResourceClaims {
    /// Create an empty claim table
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key in `keys` for `task` (exclusive access)
    ///
    /// # Errors
    /// Returns `ConflictDetected` if any key is already claimed by another task; no key
    /// is claimed in that case.
    pub fn claim(&mut self, task: &TaskId, keys: &TouchSet) -> Result<()> {
        if let Some(exclusion) = self.conflicts(task, keys) {
            return Err(ForemanError::ConflictDetected(ConflictReport::single(
                exclusion,
            )));
        }

        for key in keys {
            self.holders.insert(key.clone(), task.clone());
        }
        self.by_task
            .entry(task.clone())
            .or_default()
            .extend(keys.iter().cloned());
        Ok(())
    }

    /// Release every key held by `task`, returning the released keys.
    pub fn release(&mut self, task: &TaskId) -> TouchSet {
        let released = self.by_task.remove(task).unwrap_or_default();
        for key in &released {
            if self.holders.get(key) == Some(task) {
                self.holders.remove(key);
            }
        }
        if !released.is_empty() {
            tracing::debug!("Released {} resource key(s) held by {task}", released.len());
        }
        released
    }

    /// Overlap between `keys` and keys claimed by tasks other than `task`.
    pub fn conflicts(&self, task: &TaskId, keys: &TouchSet) -> Option<Exclusion> {
        let mut conflicts_with = BTreeSet::new();
        let mut overlapping = BTreeSet::new();

        for key in keys {
            if let Some(holder) = self.holders.get(key)
                && holder != task
            {
                conflicts_with.insert(holder.clone());
                overlapping.insert(key.clone());
            }
        }

        (!overlapping.is_empty()).then(|| Exclusion {
            task: task.clone(),
            conflicts_with,
            keys: overlapping,
        })
    }

    /// Task currently holding `key`.
    pub fn holder(&self, key: &ResourceKey) -> Option<&TaskId> {
        self.holders.get(key)
    }

    /// Keys held by `task`.
    pub fn held_by(&self, task: &TaskId) -> Option<&TouchSet> {
        self.by_task.get(task)
    }

    /// Every claimed key with its holder.
    pub fn claimed(&self) -> impl Iterator<Item = (&ResourceKey, &TaskId)> {
        self.holders.iter()
    }

    /// Whether no key is claimed.
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
