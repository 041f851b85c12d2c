//! Snapshot persistence behind a small key-value contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::types::{SnapshotSummary, WorkspaceSnapshot};

/// Abstraction over snapshot storage.
/// Real implementation: `FsStore`. Test double: `MemoryStore`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<WorkspaceSnapshot>>;

    async fn set(&self, snapshot: &WorkspaceSnapshot) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<bool>;

    /// Summary index, most recently updated first.
    async fn list(&self) -> Result<Vec<SnapshotSummary>>;
}

fn sort_summaries(summaries: &mut [SnapshotSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

/// In-process store. Counts writes so debounce behavior can be observed.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, WorkspaceSnapshot>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<WorkspaceSnapshot>> {
        let map = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    async fn set(&self, snapshot: &WorkspaceSnapshot) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut map = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut map = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        let map = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<SnapshotSummary> = map.values().map(|s| s.summary()).collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}

/// One JSON file per snapshot under `root`, plus an `index.json` summary list.
pub struct FsStore {
    root: PathBuf,
}

const INDEX_FILE: &str = "index.json";

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File for snapshot `id`. Ids that could name a path outside `root`,
    /// or the index itself, are rejected.
    fn snapshot_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") || id == "index" {
            anyhow::bail!("Invalid workspace id '{}'", id);
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    async fn read_index(&self) -> Result<Vec<SnapshotSummary>> {
        let path = self.root.join(INDEX_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse workspace index: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_index(&self, mut index: Vec<SnapshotSummary>) -> Result<()> {
        sort_summaries(&mut index);
        let content = serde_json::to_string_pretty(&index).context("Failed to serialize workspace index")?;
        write_atomic(&self.root.join(INDEX_FILE), &content).await
    }
}

/// Write to a sibling temp file, then rename over `path`.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FsStore {
    async fn get(&self, id: &str) -> Result<Option<WorkspaceSnapshot>> {
        let path = self.snapshot_path(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let snapshot = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn set(&self, snapshot: &WorkspaceSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create store directory {}", self.root.display()))?;
        let content = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;
        write_atomic(&path, &content).await?;

        let mut index = self.read_index().await?;
        index.retain(|s| s.id != snapshot.id);
        index.push(snapshot.summary());
        self.write_index(index).await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let path = self.snapshot_path(id)?;
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        };
        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|s| s.id != id);
        if index.len() != before {
            self.write_index(index).await?;
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        self.read_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::types::WorkspaceFile;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn snapshot(id: &str, age_secs: i64) -> WorkspaceSnapshot {
        let at = Utc::now() - Duration::seconds(age_secs);
        let mut files = BTreeMap::new();
        files.insert("main.js".to_string(), WorkspaceFile::new("main.js", "javascript", "1"));
        WorkspaceSnapshot {
            id: id.to_string(),
            name: format!("ws {}", id),
            files,
            created_at: at,
            updated_at: at,
            template_id: "blank".into(),
        }
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_index() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path().join("workspaces"));

        store.set(&snapshot("old", 100)).await.unwrap();
        store.set(&snapshot("new", 0)).await.unwrap();

        let loaded = store.get("old").await.unwrap().unwrap();
        assert_eq!(loaded.files.len(), 1);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["new", "old"]);
        assert_eq!(listed[0].file_count, 1);
    }

    #[tokio::test]
    async fn test_fs_store_missing_and_remove() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.set(&snapshot("a", 0)).await.unwrap();
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_overwrite_keeps_single_index_row() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let mut snap = snapshot("a", 0);
        store.set(&snap).await.unwrap();
        snap.name = "renamed".into();
        store.set(&snap).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_fs_store_rejects_ids_outside_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("workspaces");
        let store = FsStore::new(&root);
        std::fs::write(dir.path().join("outside.json"), "{}").unwrap();

        for id in ["../outside", "a/b", "a\\b", "..", "", "index"] {
            assert!(store.get(id).await.is_err(), "get accepted {:?}", id);
            assert!(store.remove(id).await.is_err(), "remove accepted {:?}", id);
            assert!(store.set(&snapshot(id, 0)).await.is_err(), "set accepted {:?}", id);
        }
        assert!(dir.path().join("outside.json").exists());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_counts_writes() {
        let store = MemoryStore::new();
        store.set(&snapshot("a", 0)).await.unwrap();
        store.set(&snapshot("a", 0)).await.unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
