use foreman_core::{ForemanError, ResourceChange, Result};
use std::sync::Arc;

use super::state::WorkspaceState;

/// Changes applied to the workspace that can still be undone.
///
/// [`Transaction::apply`] either applies every change or none of them. Once applied,
/// the caller decides: [`Transaction::commit`] keeps the changes, and
/// [`Transaction::rollback`] restores every touched resource to its prior content.
#[must_use = "an applied transaction must be committed or rolled back"]
pub struct Transaction {
    workspace: Arc<WorkspaceState>,
    undo: Vec<ResourceChange>,
}

impl Transaction {
    /// Apply `changes` in order, undoing the applied prefix if one of them fails.
    ///
    /// # Errors
    /// Returns the failure of the offending change once the prefix is undone, or
    /// `IncompleteRollback` if the workspace could not be restored.
    pub async fn apply(workspace: &Arc<WorkspaceState>, changes: &[ResourceChange]) -> Result<Self> {
        let mut transaction = Self {
            workspace: Arc::clone(workspace),
            undo: Vec::with_capacity(changes.len()),
        };

        for change in changes {
            let key = change.key().clone();
            let applied = match workspace.read(&key).await {
                Ok(prior) => workspace.apply(change).await.map(|()| prior),
                Err(error) => Err(error),
            };
            match applied {
                Ok(Some(content)) => transaction
                    .undo
                    .push(ResourceChange::Modify { key, content }),
                Ok(None) => transaction.undo.push(ResourceChange::Delete { key }),
                Err(error) => {
                    tracing::warn!("Applying change to {key} failed: {error}");
                    transaction.rollback().await?;
                    return Err(error);
                }
            }
        }
        Ok(transaction)
    }

    /// Keep the applied changes. Returns how many resources changed.
    pub fn commit(self) -> usize {
        self.undo.len()
    }

    /// Restore every resource this transaction changed, newest first.
    ///
    /// # Errors
    /// Returns `IncompleteRollback` naming the resources left changed.
    pub async fn rollback(self) -> Result<()> {
        let mut stuck = Vec::new();
        for change in self.undo.iter().rev() {
            if let Err(error) = self.workspace.apply(change).await {
                tracing::error!("Could not restore {}: {error}", change.key());
                stuck.push(change.key().to_string());
            }
        }
        if stuck.is_empty() {
            tracing::debug!("Rolled back {} resource change(s)", self.undo.len());
            Ok(())
        } else {
            Err(ForemanError::IncompleteRollback(stuck.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{Content, ResourceKey};
    use std::fs::{read_to_string, write};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_change_undoes_applied_prefix() {
        let temp = TempDir::new().expect("create temp dir");
        write(temp.path().join("kept.txt"), "OLD").unwrap();
        let workspace = WorkspaceState::new(temp.path().to_path_buf());

        let error = Transaction::apply(
            &workspace,
            &[
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
        )
        .await
        .err()
        .expect("a file cannot also be a directory");
        assert!(matches!(error, ForemanError::Io(_)), "unexpected error: {error}");

        assert_eq!(read_to_string(temp.path().join("kept.txt")).unwrap(), "OLD");
        assert!(!temp.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_content() {
        let workspace = WorkspaceState::in_memory();
        let key = ResourceKey::new("a.txt");
        workspace
            .apply(&ResourceChange::Create {
                key: key.clone(),
                content: "before".into(),
            })
            .await
            .unwrap();

        let transaction = Transaction::apply(
            &workspace,
            &[
                ResourceChange::Modify {
                    key: key.clone(),
                    content: "after".into(),
                },
                ResourceChange::Create {
                    key: ResourceKey::new("b.txt"),
                    content: "new".into(),
                },
            ],
        )
        .await
        .unwrap();
        assert_eq!(workspace.read(&key).await.unwrap(), Some(Content::from("after")));

        transaction.rollback().await.unwrap();
        assert_eq!(workspace.read(&key).await.unwrap(), Some(Content::from("before")));
        assert_eq!(workspace.read(&ResourceKey::new("b.txt")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_keeps_changes() {
        let workspace = WorkspaceState::in_memory();
        let key = ResourceKey::new("a.txt");
        let transaction = Transaction::apply(
            &workspace,
            &[ResourceChange::Create {
                key: key.clone(),
                content: "kept".into(),
            }],
        )
        .await
        .unwrap();

        assert_eq!(transaction.commit(), 1);
        assert_eq!(workspace.read(&key).await.unwrap(), Some(Content::from("kept")));
    }
}
