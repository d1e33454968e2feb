// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-known-good snapshots of a mirrored collection.
//!
//! A snapshot is written after every successful fetch and read back only
//! when a fetch fails while the mirror is empty, so the consumer has
//! something to show. It is a fallback, not a source of truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::SyncError;
use crate::types::{Resource, ScopeId};

/// Items of one scope as of `saved_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub scope: ScopeId,
    pub saved_at: DateTime<Utc>,
    pub items: Vec<Resource>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, scope: &ScopeId) -> Result<Option<Snapshot>, SyncError>;
    async fn save(&self, scope: &ScopeId, items: &[Resource]) -> Result<(), SyncError>;
}

/// In-process store; survives engine restarts, not process restarts.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    data: DashMap<ScopeId, Snapshot>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, scope: &ScopeId) -> Result<Option<Snapshot>, SyncError> {
        Ok(self.data.get(scope).map(|r| r.value().clone()))
    }

    async fn save(&self, scope: &ScopeId, items: &[Resource]) -> Result<(), SyncError> {
        self.data.insert(
            scope.clone(),
            Snapshot {
                scope: scope.clone(),
                saved_at: Utc::now(),
                items: items.to_vec(),
            },
        );
        Ok(())
    }
}

/// One JSON file per scope under a directory.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, scope: &ScopeId) -> PathBuf {
        let name: String = scope
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("snapshot-{name}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, scope: &ScopeId) -> Result<Option<Snapshot>, SyncError> {
        let path = self.path_for(scope);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Snapshot(format!("{}: {e}", path.display()))),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Snapshot(format!("{}: {e}", path.display())))?;

        // Two scopes can sanitize to the same file name
        if &snapshot.scope != scope {
            warn!(path = %path.display(), expected = %scope, found = %snapshot.scope, "Snapshot belongs to another scope");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, scope: &ScopeId, items: &[Resource]) -> Result<(), SyncError> {
        let snapshot = Snapshot {
            scope: scope.clone(),
            saved_at: Utc::now(),
            items: items.to_vec(),
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| SyncError::Snapshot(e.to_string()))?;

        let io_err = |e: std::io::Error| SyncError::Snapshot(e.to_string());
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!(path = %path.display(), items = items.len(), "Snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceStatus;
    use tempfile::tempdir;

    fn items() -> Vec<Resource> {
        vec![
            Resource::new("1", ResourceStatus::Ready),
            Resource::new("2", ResourceStatus::Processing),
        ]
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        let scope = ScopeId::new("org-1");
        assert!(store.load(&scope).await.unwrap().is_none());

        store.save(&scope, &items()).await.unwrap();
        let snapshot = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(snapshot.items, items());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let scope = ScopeId::new("org/1");

        FileSnapshotStore::new(dir.path())
            .save(&scope, &items())
            .await
            .unwrap();

        let reopened = FileSnapshotStore::new(dir.path());
        let snapshot = reopened.load(&scope).await.unwrap().unwrap();
        assert_eq!(snapshot.scope, scope);
        assert_eq!(snapshot.items.len(), 2);
        assert!(!dir.path().join("snapshot-org_1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let scope = ScopeId::new("org-1");
        assert!(store.load(&scope).await.unwrap().is_none());

        std::fs::write(dir.path().join("snapshot-org-1.json"), b"{not json").unwrap();
        assert!(matches!(store.load(&scope).await, Err(SyncError::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_file_store_rejects_colliding_scope() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        store.save(&ScopeId::new("org/1"), &items()).await.unwrap();
        // "org:1" sanitizes to the same file name
        assert!(store.load(&ScopeId::new("org:1")).await.unwrap().is_none());
    }
}
