//! Folder registry.
//!
//! Sessions dispatch into their folder group by folder id through this map
//! rather than holding owning references. Removing a folder clears its entry
//! first, so a late dispatch from a closing session simply finds nothing.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use skiff_base::FolderId;

use crate::folder::FolderGroup;

/// Shared folder-id to folder-group map.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<FolderId, FolderGroup>>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a folder group under its id.
    pub async fn register(&self, group: FolderGroup) {
        self.inner.write().await.insert(group.folder_id(), group);
    }

    /// Remove and return a folder group.
    pub async fn unregister(&self, folder_id: &FolderId) -> Option<FolderGroup> {
        self.inner.write().await.remove(folder_id)
    }

    /// Look up a folder group.
    pub async fn get(&self, folder_id: &FolderId) -> Option<FolderGroup> {
        self.inner.read().await.get(folder_id).cloned()
    }

    /// Whether the folder is present.
    pub async fn contains(&self, folder_id: &FolderId) -> bool {
        self.inner.read().await.contains_key(folder_id)
    }

    /// Ids of all registered folders.
    pub async fn folder_ids(&self) -> Vec<FolderId> {
        self.inner.read().await.keys().copied().collect()
    }
}
