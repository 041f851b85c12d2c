//! In-memory virtual file set with debounced persistence.
//!
//! The [`WorkspaceModel`] owns the single current [`WorkspaceSnapshot`]. All
//! mutations go through it: each one refreshes `updated_at`, publishes
//! `workspace:changed`, and nudges the background writer.

pub mod graph;
mod persist;
pub mod store;
pub mod types;

pub use graph::DependencyGraph;
pub use store::{FsStore, MemoryStore, SnapshotStore};
pub use types::{
    FileMetadata, SnapshotSummary, TEMPLATES, Template, WorkspaceFile, WorkspaceSnapshot,
    find_template, language_for_path, normalize_path,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use walkdir::WalkDir;

use crate::bus::{Event, EventBus, WorkspaceChange};
use crate::errors::WorkspaceError;
use persist::{PersistMsg, PersistWriter, SharedSnapshot};

/// Default debounce window for persistence writes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

/// Directories never pulled in by [`WorkspaceModel::import_dir`].
const IGNORED_DIRS: &[&str] = &[".git", ".codeloop", "node_modules", "target", "__pycache__", ".venv"];

/// Entry candidates tried, in order, when importing a directory.
const ENTRY_CANDIDATES: &[&str] = &["main.js", "index.js", "app.js", "main.py", "app.py", "index.html"];

/// Largest file accepted by `import_dir`.
const MAX_IMPORT_BYTES: u64 = 512 * 1024;

#[derive(Clone)]
pub struct WorkspaceModel {
    current: SharedSnapshot,
    store: Arc<dyn SnapshotStore>,
    bus: EventBus,
    writer: mpsc::UnboundedSender<PersistMsg>,
}

impl WorkspaceModel {
    /// Create the model and spawn its writer task. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Arc<dyn SnapshotStore>, bus: EventBus, debounce: Duration) -> Self {
        let current: SharedSnapshot = Arc::new(Mutex::new(None));
        let writer = PersistWriter::spawn(current.clone(), store.clone(), bus.clone(), debounce);
        Self {
            current,
            store,
            bus,
            writer,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn get_current(&self) -> Option<WorkspaceSnapshot> {
        self.lock().clone()
    }

    pub fn current_id(&self) -> Option<String> {
        self.lock().as_ref().map(|s| s.id.clone())
    }

    /// Current snapshot or [`WorkspaceError::NoCurrent`].
    pub fn require_current(&self) -> Result<WorkspaceSnapshot, WorkspaceError> {
        self.get_current().ok_or(WorkspaceError::NoCurrent)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<WorkspaceSnapshot>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the stored snapshot `id` current. Pending writes for the previous
    /// snapshot are flushed first.
    pub async fn load(&self, id: &str) -> Result<WorkspaceSnapshot, WorkspaceError> {
        self.flush().await?;
        let snapshot = self
            .store
            .get(id)
            .await
            .map_err(WorkspaceError::Store)?
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?;

        *self.lock() = Some(snapshot.clone());
        tracing::info!(workspace_id = %snapshot.id, files = snapshot.files.len(), "workspace loaded");
        self.bus.publish(Event::WorkspaceLoaded {
            workspace_id: snapshot.id.clone(),
        });
        Ok(snapshot)
    }

    /// Create a snapshot from a built-in template and make it current.
    pub async fn create(&self, template_id: &str, name: &str) -> Result<WorkspaceSnapshot, WorkspaceError> {
        let template = find_template(template_id).ok_or_else(|| WorkspaceError::TemplateNotFound {
            id: template_id.to_string(),
        })?;

        let mut files = BTreeMap::new();
        for (path, content) in template.files {
            let mut file = WorkspaceFile::new(*path, language_for_path(path), *content);
            file.metadata.entry = template.entry == Some(*path);
            files.insert(path.to_string(), file);
        }
        self.install(files, template.id, name).await
    }

    /// Create a snapshot from the text files under `dir` and make it current.
    pub async fn import_dir(&self, dir: &Path, name: &str) -> Result<WorkspaceSnapshot, WorkspaceError> {
        let files = read_dir_files(dir).map_err(WorkspaceError::Store)?;
        self.install(files, "import", name).await
    }

    async fn install(
        &self,
        mut files: BTreeMap<String, WorkspaceFile>,
        template_id: &str,
        name: &str,
    ) -> Result<WorkspaceSnapshot, WorkspaceError> {
        if !files.values().any(|f| f.is_entry())
            && let Some(entry) = ENTRY_CANDIDATES.iter().find(|c| files.contains_key(**c))
            && let Some(file) = files.get_mut(*entry)
        {
            file.metadata.entry = true;
        }

        self.flush().await?;
        let now = Utc::now();
        let snapshot = WorkspaceSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            files,
            created_at: now,
            updated_at: now,
            template_id: template_id.to_string(),
        };
        *self.lock() = Some(snapshot.clone());

        tracing::info!(workspace_id = %snapshot.id, template = template_id, "workspace created");
        self.bus.publish(Event::WorkspaceCreated {
            workspace_id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            template_id: snapshot.template_id.clone(),
        });
        self.mark_dirty();
        Ok(snapshot)
    }

    /// Insert or replace a file. An empty `language` is inferred from the
    /// extension. Replacing keeps `created_at` and the entry flag.
    pub fn upsert_file(&self, path: &str, language: &str, content: &str) -> Result<WorkspaceFile, WorkspaceError> {
        let path = checked_path(path)?;
        let language = if language.is_empty() {
            language_for_path(&path).to_string()
        } else {
            language.to_string()
        };

        self.mutate(WorkspaceChange::Upserted, |snapshot| {
            let now = Utc::now();
            let file = match snapshot.files.get(&path) {
                Some(existing) => WorkspaceFile {
                    language,
                    content: content.to_string(),
                    updated_at: now,
                    ..existing.clone()
                },
                None => WorkspaceFile::new(path.clone(), language, content),
            };
            snapshot.files.insert(path.clone(), file.clone());
            Ok((file, vec![path]))
        })
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<WorkspaceFile, WorkspaceError> {
        let old_path = checked_path(old_path)?;
        let new_path = checked_path(new_path)?;

        self.mutate(WorkspaceChange::Renamed, |snapshot| {
            if old_path == new_path {
                return snapshot
                    .files
                    .get(&old_path)
                    .cloned()
                    .map(|f| (f, vec![old_path.clone()]))
                    .ok_or(WorkspaceError::FileNotFound { path: old_path.clone() });
            }
            if snapshot.files.contains_key(&new_path) {
                return Err(WorkspaceError::PathExists { path: new_path.clone() });
            }
            let existing = snapshot
                .files
                .remove(&old_path)
                .ok_or_else(|| WorkspaceError::FileNotFound { path: old_path.clone() })?;
            let renamed = WorkspaceFile {
                path: new_path.clone(),
                updated_at: Utc::now(),
                ..existing
            };
            snapshot.files.insert(new_path.clone(), renamed.clone());
            Ok((renamed, vec![old_path.clone(), new_path.clone()]))
        })
    }

    pub fn delete_file(&self, path: &str) -> Result<WorkspaceFile, WorkspaceError> {
        let path = checked_path(path)?;
        self.mutate(WorkspaceChange::Deleted, |snapshot| {
            let removed = snapshot
                .files
                .remove(&path)
                .ok_or_else(|| WorkspaceError::FileNotFound { path: path.clone() })?;
            Ok((removed, vec![path.clone()]))
        })
    }

    /// Flag `path` as the entry point and clear the flag on every other file.
    pub fn set_entry(&self, path: &str) -> Result<(), WorkspaceError> {
        let path = checked_path(path)?;
        self.mutate(WorkspaceChange::EntryChanged, |snapshot| {
            if !snapshot.files.contains_key(&path) {
                return Err(WorkspaceError::FileNotFound { path: path.clone() });
            }
            let now = Utc::now();
            let mut affected = Vec::new();
            for (p, file) in snapshot.files.iter_mut() {
                let is_target = *p == path;
                if file.metadata.entry != is_target {
                    file.metadata.entry = is_target;
                    file.updated_at = now;
                    affected.push(p.clone());
                }
            }
            Ok(((), affected))
        })
    }

    /// Run `f` against the current snapshot, then bump `updated_at`, publish
    /// the change and schedule a write. Nothing is published on error.
    fn mutate<T>(
        &self,
        change: WorkspaceChange,
        f: impl FnOnce(&mut WorkspaceSnapshot) -> Result<(T, Vec<String>), WorkspaceError>,
    ) -> Result<T, WorkspaceError> {
        let (value, paths, workspace_id) = {
            let mut guard = self.lock();
            let snapshot = guard.as_mut().ok_or(WorkspaceError::NoCurrent)?;
            let (value, paths) = f(snapshot)?;
            snapshot.updated_at = Utc::now();
            (value, paths, snapshot.id.clone())
        };

        tracing::debug!(%workspace_id, ?change, ?paths, "workspace changed");
        self.bus.publish(Event::WorkspaceChanged {
            workspace_id,
            change,
            paths,
        });
        self.mark_dirty();
        Ok(value)
    }

    fn mark_dirty(&self) {
        if self.writer.send(PersistMsg::Dirty).is_err() {
            tracing::warn!("workspace writer is gone; change will not be persisted");
        }
    }

    /// Force any pending write and wait for it.
    pub async fn flush(&self) -> Result<(), WorkspaceError> {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(PersistMsg::Flush(tx)).is_err() {
            return Err(WorkspaceError::Store(anyhow::anyhow!("workspace writer is gone")));
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(WorkspaceError::Store(anyhow::anyhow!(message))),
            Err(_) => Err(WorkspaceError::Store(anyhow::anyhow!("workspace writer dropped flush request"))),
        }
    }

    pub async fn list(&self) -> Result<Vec<SnapshotSummary>, WorkspaceError> {
        self.store.list().await.map_err(WorkspaceError::Store)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, WorkspaceError> {
        if self.current_id().as_deref() == Some(id) {
            *self.lock() = None;
        }
        self.store.remove(id).await.map_err(WorkspaceError::Store)
    }

    /// Write the files of snapshot `id` under `dir`. Returns the number of
    /// files written.
    pub async fn export_dir(&self, id: &str, dir: &Path) -> Result<usize, WorkspaceError> {
        let snapshot = match self.get_current() {
            Some(current) if current.id == id => current,
            _ => self
                .store
                .get(id)
                .await
                .map_err(WorkspaceError::Store)?
                .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?,
        };

        for file in snapshot.files.values() {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))
                    .map_err(WorkspaceError::Store)?;
            }
            tokio::fs::write(&target, &file.content)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))
                .map_err(WorkspaceError::Store)?;
        }
        tracing::info!(workspace_id = id, dir = %dir.display(), files = snapshot.files.len(), "workspace exported");
        Ok(snapshot.files.len())
    }
}

fn checked_path(path: &str) -> Result<String, WorkspaceError> {
    normalize_path(path).ok_or_else(|| WorkspaceError::InvalidPath { path: path.to_string() })
}

fn read_dir_files(dir: &Path) -> anyhow::Result<BTreeMap<String, WorkspaceFile>> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        e.depth() == 0 || !(e.file_type().is_dir() && IGNORED_DIRS.iter().any(|d| *d == name))
    });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_IMPORT_BYTES {
            tracing::debug!(path = %entry.path().display(), size, "skipping large file");
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            tracing::debug!(path = %entry.path().display(), "skipping non-UTF-8 file");
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
        let Some(path) = normalize_path(&rel.to_string_lossy()) else {
            continue;
        };
        let language = language_for_path(&path);
        files.insert(path.clone(), WorkspaceFile::new(path, language, content));
    }
    Ok(files)
}
