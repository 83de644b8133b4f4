//! Resource changes produced by workers

use serde::{Deserialize, Serialize};

use super::content::Content;
use super::record::ResourceKey;

/// A single change to a tracked resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ResourceChange {
    /// Create a new resource
    Create {
        /// Resource to create
        key: ResourceKey,
        /// Initial content
        content: Content,
    },
    /// Replace the content of an existing resource
    Modify {
        /// Resource to modify
        key: ResourceKey,
        /// New content
        content: Content,
    },
    /// Remove a resource
    Delete {
        /// Resource to delete
        key: ResourceKey,
    },
}

impl ResourceChange {
    /// Resource this change applies to.
    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Create { key, .. } | Self::Modify { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Content after the change, `None` for deletions.
    pub fn content(&self) -> Option<&Content> {
        match self {
            Self::Create { content, .. } | Self::Modify { content, .. } => Some(content),
            Self::Delete { .. } => None,
        }
    }
}
