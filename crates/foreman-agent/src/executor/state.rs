use foreman_core::{Content, ForemanError, ResourceChange, ResourceKey, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

/// Where tracked resources live.
#[derive(Debug)]
enum Backing {
    /// Files under a root directory; keys are relative paths
    Directory(PathBuf),
    /// In-process contents only
    Memory(RwLock<HashMap<ResourceKey, Content>>),
}

/// Tracked resources (synchronized).
///
/// Only the coordinator applies changes; workers receive copies of the content they
/// need inside their assignment.
#[derive(Debug)]
pub struct WorkspaceState {
    backing: Backing,
}

impl WorkspaceState {
    /// Workspace backed by the files under `root_path`
    #[must_use]
    pub fn new(root_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            backing: Backing::Directory(root_path),
        })
    }

    /// Workspace that never touches the filesystem
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            backing: Backing::Memory(RwLock::new(HashMap::new())),
        })
    }

    /// Root directory, if file backed
    pub fn root_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Directory(root) => Some(root),
            Backing::Memory(_) => None,
        }
    }

    /// Current content of a resource; `None` when it does not exist.
    ///
    /// # Errors
    /// Returns an error if the key escapes the workspace root or the file cannot be read.
    pub async fn read(&self, key: &ResourceKey) -> Result<Option<Content>> {
        match &self.backing {
            Backing::Memory(files) => Ok(files.read().await.get(key).cloned()),
            Backing::Directory(root) => {
                let path = resolve(root, key)?;
                match fs::read(&path).await {
                    Ok(bytes) => Ok(Some(Content::from(bytes))),
                    Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    /// Apply resource changes in order, stopping at the first failure.
    ///
    /// Use [`Transaction`](super::Transaction) when earlier changes must be undone if a
    /// later one fails.
    ///
    /// # Errors
    /// Returns an error if a key escapes the workspace root or a file operation fails;
    /// changes before the failing one stay applied.
    pub async fn apply_changes(&self, changes: &[ResourceChange]) -> Result<()> {
        for change in changes {
            self.apply(change).await?;
        }
        tracing::debug!("Applied {} resource change(s)", changes.len());
        Ok(())
    }

    /// Apply one change. A file is either fully replaced or left as it was.
    ///
    /// # Errors
    /// Returns an error if the key escapes the workspace root or the file operation fails.
    pub async fn apply(&self, change: &ResourceChange) -> Result<()> {
        match &self.backing {
            Backing::Memory(files) => {
                let mut files = files.write().await;
                match change {
                    ResourceChange::Create { key, content }
                    | ResourceChange::Modify { key, content } => {
                        files.insert(key.clone(), content.clone());
                    }
                    ResourceChange::Delete { key } => {
                        files.remove(key);
                    }
                }
                Ok(())
            }
            Backing::Directory(root) => {
                let path = resolve(root, change.key())?;
                match change {
                    ResourceChange::Create { content, .. }
                    | ResourceChange::Modify { content, .. } => {
                        write_replacing(&path, content.as_bytes()).await
                    }
                    ResourceChange::Delete { .. } => match fs::remove_file(&path).await {
                        Ok(()) => Ok(()),
                        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                        Err(error) => Err(error.into()),
                    },
                }
            }
        }
    }

    /// Capture the current content of specific resources
    ///
    /// # Errors
    /// Returns an error if any resource cannot be read.
    pub async fn snapshot<'key>(
        &self,
        keys: impl IntoIterator<Item = &'key ResourceKey>,
    ) -> Result<WorkspaceSnapshot> {
        let mut resources = BTreeMap::new();
        for key in keys {
            resources.insert(key.clone(), self.read(key).await?);
        }
        Ok(WorkspaceSnapshot { resources })
    }
}

/// Writes `bytes` next to `path` and renames the copy over it.
async fn write_replacing(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".foreman-tmp");
    let staging = PathBuf::from(staging);

    let written = match fs::write(&staging, bytes).await {
        Ok(()) => fs::rename(&staging, path).await,
        Err(error) => Err(error),
    };
    let Err(error) = written else {
        return Ok(());
    };
    match fs::remove_file(&staging).await {
        Err(cleanup) if cleanup.kind() != ErrorKind::NotFound => {
            tracing::warn!("Could not remove {}: {cleanup}", staging.display());
        }
        _ => {}
    }
    Err(error.into())
}

/// Maps a key onto a path below `root`, rejecting keys that would leave it.
fn resolve(root: &Path, key: &ResourceKey) -> Result<PathBuf> {
    let relative = Path::new(key.as_str());
    let escapes = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes || key.as_str().is_empty() {
        return Err(ForemanError::Other(format!(
            "resource key {key} is not a path inside the workspace"
        )));
    }
    Ok(root.join(relative))
}

/// Immutable copy of resource contents at one point in time
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    resources: BTreeMap<ResourceKey, Option<Content>>,
}

impl WorkspaceSnapshot {
    /// Content captured for `key` (`None` if the resource did not exist or was not captured)
    pub fn get(&self, key: &ResourceKey) -> Option<&Content> {
        self.resources.get(key).and_then(Option::as_ref)
    }

    /// Consume into the captured map
    pub fn into_resources(self) -> BTreeMap<ResourceKey, Option<Content>> {
        self.resources
    }
}
