//! Size-bounded log of past task outcomes.
//!
//! Items are kept oldest-first and trimmed from the front once the cap is
//! exceeded. Statistics and relevance scores are derived on demand and never
//! stored. When a path is configured, the whole log is rewritten as JSON after
//! every mutation.

pub mod classify;
pub mod types;

pub use classify::{classify, extract_tags};
pub use types::{
    Category, ImportMode, ImportReport, MemoryExport, MemoryFilter, MemoryPatch, MemoryStatistics,
    NewMemoryItem, Outcome, ScoredItem, TaskMemoryItem,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::bus::{Event, EventBus};

/// Default retained item count.
pub const DEFAULT_MAX_ITEMS: usize = 500;

const EXPORT_VERSION: u32 = 1;

/// Number of entries reported in the top-files and top-tags lists.
const TOP_N: usize = 10;

const SAME_CATEGORY_WEIGHT: f64 = 2.0;
const SHARED_TAG_WEIGHT: f64 = 1.0;
const SHARED_FILE_WEIGHT: f64 = 1.5;

#[derive(Clone)]
pub struct TaskMemory {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    items: Mutex<Vec<TaskMemoryItem>>,
    max_items: usize,
    path: Option<PathBuf>,
    bus: Option<EventBus>,
}

impl TaskMemory {
    /// In-memory log without persistence.
    pub fn new(max_items: usize) -> Self {
        Self::build(Vec::new(), max_items, None, None)
    }

    /// Load the log from `path` (missing file means empty) and keep it in sync.
    pub fn open(path: impl Into<PathBuf>, max_items: usize) -> Result<Self> {
        let path = path.into();
        let items = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read task memory: {}", path.display()))?;
            parse_items(&content).with_context(|| format!("Failed to parse task memory: {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self::build(items, max_items, Some(path), None))
    }

    fn build(mut items: Vec<TaskMemoryItem>, max_items: usize, path: Option<PathBuf>, bus: Option<EventBus>) -> Self {
        items.sort_by_key(|i| i.created_at);
        trim(&mut items, max_items);
        Self {
            inner: Arc::new(MemoryInner {
                items: Mutex::new(items),
                max_items,
                path,
                bus,
            }),
        }
    }

    /// Publish `memory:added` on `bus` for every new item.
    pub fn with_bus(self, bus: EventBus) -> Self {
        let items = self.lock().clone();
        Self::build(items, self.inner.max_items, self.inner.path.clone(), Some(bus))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TaskMemoryItem>> {
        self.inner.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn max_items(&self) -> usize {
        self.inner.max_items
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<TaskMemoryItem> {
        self.lock().iter().find(|i| i.id == id).cloned()
    }

    /// All items, oldest first.
    pub fn items(&self) -> Vec<TaskMemoryItem> {
        self.lock().clone()
    }

    pub fn add(&self, new: NewMemoryItem) -> TaskMemoryItem {
        let text = format!("{} {}", new.goal, new.summary);
        let tags = match new.tags {
            Some(tags) => tags,
            None => {
                let mut tags = extract_tags(&new.focus_paths, &text);
                tags.extend(new.extra_tags.iter().map(|t| t.to_lowercase()));
                tags.sort();
                tags.dedup();
                tags
            }
        };

        let now = Utc::now();
        let item = TaskMemoryItem {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            category: new.category.unwrap_or_else(|| classify(&text)),
            goal: new.goal,
            focus_paths: new.focus_paths,
            outcome: new.outcome.unwrap_or(Outcome::Success),
            summary: new.summary,
            tags,
            duration_ms: new.duration_ms,
            iterations: new.iterations,
            tokens_used: new.tokens_used,
            files_modified: new.files_modified,
        };

        {
            let mut items = self.lock();
            items.push(item.clone());
            let dropped = trim(&mut items, self.inner.max_items);
            if dropped > 0 {
                tracing::debug!(dropped, "task memory trimmed");
            }
        }
        tracing::debug!(item_id = %item.id, category = %item.category, outcome = %item.outcome, "memory item added");
        self.persist();

        if let Some(bus) = &self.inner.bus {
            bus.publish(Event::MemoryAdded {
                item_id: item.id.clone(),
                outcome: item.outcome,
            });
        }
        item
    }

    /// Apply `patch` to item `id`. Returns the updated item, or `None` if it
    /// does not exist.
    pub fn update(&self, id: &str, patch: MemoryPatch) -> Option<TaskMemoryItem> {
        let updated = {
            let mut items = self.lock();
            let item = items.iter_mut().find(|i| i.id == id)?;
            if let Some(outcome) = patch.outcome {
                item.outcome = outcome;
            }
            if let Some(summary) = patch.summary {
                item.summary = summary;
            }
            if let Some(tags) = patch.tags {
                item.tags = tags;
            }
            if let Some(category) = patch.category {
                item.category = category;
            }
            if let Some(duration_ms) = patch.duration_ms {
                item.duration_ms = duration_ms;
            }
            if let Some(iterations) = patch.iterations {
                item.iterations = iterations;
            }
            if let Some(tokens_used) = patch.tokens_used {
                item.tokens_used = tokens_used;
            }
            if let Some(files) = patch.files_modified {
                item.files_modified = files;
            }
            item.updated_at = Utc::now();
            item.clone()
        };
        self.persist();
        Some(updated)
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut items = self.lock();
            let before = items.len();
            items.retain(|i| i.id != id);
            before != items.len()
        };
        if removed {
            self.persist();
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.persist();
    }

    /// Items matching `filter`. With a query, results are ordered by the
    /// fraction of query terms found in goal + summary (zero scores dropped);
    /// without one, newest first with score 1.0.
    pub fn search(&self, filter: &MemoryFilter) -> Vec<ScoredItem> {
        let terms: Vec<String> = filter
            .query
            .as_deref()
            .map(query_terms)
            .unwrap_or_default();
        let tags_any: HashSet<String> = filter.tags_any.iter().map(|t| t.to_lowercase()).collect();

        let items = self.lock();
        let mut hits: Vec<ScoredItem> = items
            .iter()
            .rev()
            .filter(|i| filter.outcome.is_none_or(|o| i.outcome == o))
            .filter(|i| tags_any.is_empty() || i.tags.iter().any(|t| tags_any.contains(t)))
            .filter(|i| filter.category.is_none_or(|c| i.category == c))
            .filter(|i| filter.since.is_none_or(|s| i.created_at >= s))
            .filter(|i| filter.until.is_none_or(|u| i.created_at <= u))
            .filter(|i| filter.min_duration_ms.is_none_or(|d| i.duration_ms >= d))
            .filter(|i| filter.max_duration_ms.is_none_or(|d| i.duration_ms <= d))
            .filter_map(|i| {
                let score = relevance(i, &terms);
                (score > 0.0).then(|| ScoredItem { item: i.clone(), score })
            })
            .collect();
        drop(items);

        // Stable: equal scores stay newest first.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        hits
    }

    /// Past tasks worth showing an agent working on `goal`.
    pub fn context_for(&self, goal: &str, limit: usize) -> Vec<TaskMemoryItem> {
        if limit == 0 {
            return Vec::new();
        }
        self.search(&MemoryFilter {
            query: Some(goal.to_string()),
            limit: Some(limit),
            ..Default::default()
        })
        .into_iter()
        .map(|hit| hit.item)
        .collect()
    }

    /// Items most similar to `id`: +2 same category, +1 per shared tag, +1.5
    /// per shared modified file. Excludes `id` itself and zero scores; ties keep
    /// log order.
    pub fn related(&self, id: &str, limit: usize) -> Vec<ScoredItem> {
        let items = self.lock();
        let Some(target) = items.iter().find(|i| i.id == id) else {
            return Vec::new();
        };
        let tags: HashSet<&str> = target.tags.iter().map(String::as_str).collect();
        let files: HashSet<&str> = target.files_modified.iter().map(String::as_str).collect();

        let mut scored: Vec<ScoredItem> = items
            .iter()
            .filter(|i| i.id != target.id)
            .filter_map(|i| {
                let mut score = 0.0;
                if i.category == target.category {
                    score += SAME_CATEGORY_WEIGHT;
                }
                score += SHARED_TAG_WEIGHT * i.tags.iter().filter(|t| tags.contains(t.as_str())).count() as f64;
                score += SHARED_FILE_WEIGHT
                    * i.files_modified.iter().filter(|f| files.contains(f.as_str())).count() as f64;
                (score > 0.0).then(|| ScoredItem { item: i.clone(), score })
            })
            .collect();
        drop(items);

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }

    pub fn statistics(&self) -> MemoryStatistics {
        let items = self.lock();
        let total = items.len();
        let mut stats = MemoryStatistics {
            total,
            ..Default::default()
        };
        if total == 0 {
            return stats;
        }

        let mut files: HashMap<&str, usize> = HashMap::new();
        let mut tags: HashMap<&str, usize> = HashMap::new();
        let mut duration_sum = 0u64;

        for item in items.iter() {
            *stats.by_outcome.entry(item.outcome).or_default() += 1;
            *stats.by_category.entry(item.category).or_default() += 1;
            duration_sum += item.duration_ms;
            stats.total_tokens += item.tokens_used;
            for f in &item.files_modified {
                *files.entry(f).or_default() += 1;
            }
            for t in &item.tags {
                *tags.entry(t).or_default() += 1;
            }
        }

        stats.average_duration_ms = duration_sum as f64 / total as f64;
        stats.top_files = top_counts(files);
        stats.top_tags = top_counts(tags);
        let successes = stats.by_outcome.get(&Outcome::Success).copied().unwrap_or(0);
        stats.success_rate = successes as f64 / total as f64;
        stats
    }

    pub fn export(&self) -> Result<String> {
        let export = MemoryExport {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            items: self.items(),
        };
        serde_json::to_string_pretty(&export).context("Failed to serialize task memory")
    }

    /// Import items from an export (or a bare JSON array of items).
    ///
    /// `Merge` adds unknown ids and replaces known ones when the incoming copy
    /// is newer. `Replace` discards the current log first.
    pub fn import(&self, json: &str, mode: ImportMode) -> Result<ImportReport> {
        let incoming = parse_items(json).context("Failed to parse task memory import")?;
        let mut report = ImportReport::default();
        {
            let mut items = self.lock();
            if mode == ImportMode::Replace {
                items.clear();
            }
            let mut index: BTreeMap<String, usize> =
                items.iter().enumerate().map(|(i, item)| (item.id.clone(), i)).collect();

            for item in incoming {
                match index.get(&item.id) {
                    Some(&pos) if items[pos].updated_at < item.updated_at => {
                        items[pos] = item;
                        report.updated += 1;
                    }
                    Some(_) => report.skipped += 1,
                    None => {
                        index.insert(item.id.clone(), items.len());
                        items.push(item);
                        report.added += 1;
                    }
                }
            }
            items.sort_by_key(|i| i.created_at);
            trim(&mut items, self.inner.max_items);
        }
        self.save()?;
        tracing::info!(added = report.added, updated = report.updated, skipped = report.skipped, "task memory imported");
        Ok(report)
    }

    /// Write the log to its configured path. No-op without a path.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = self.export()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write task memory: {}", path.display()))?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %format!("{:#}", e), "failed to persist task memory");
        }
    }
}

fn parse_items(json: &str) -> Result<Vec<TaskMemoryItem>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }
    let export: MemoryExport = serde_json::from_value(value)?;
    Ok(export.items)
}

/// Drop the oldest items beyond `max`. Returns how many were dropped.
fn trim(items: &mut Vec<TaskMemoryItem>, max: usize) -> usize {
    let excess = items.len().saturating_sub(max);
    items.drain(..excess);
    excess
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    let mut seen = HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));
    terms
}

fn relevance(item: &TaskMemoryItem, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 1.0;
    }
    let haystack = format!("{} {}", item.goal, item.summary).to_lowercase();
    let found = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    found as f64 / terms.len() as f64
}

fn top_counts(counts: HashMap<&str, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_N);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventKind, HistoryFilter};
    use tempfile::tempdir;

    fn new_item(goal: &str, outcome: Outcome, files: &[&str]) -> NewMemoryItem {
        NewMemoryItem {
            goal: goal.to_string(),
            focus_paths: files.iter().map(|f| f.to_string()).collect(),
            outcome: Some(outcome),
            summary: String::new(),
            files_modified: files.iter().map(|f| f.to_string()).collect(),
            duration_ms: 1000,
            tokens_used: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_derives_category_and_tags() {
        let memory = TaskMemory::new(10);
        let item = memory.add(new_item("Fix the logging crash", Outcome::Success, &["main.js"]));
        assert_eq!(item.category, Category::Bugfix);
        assert_eq!(item.tags, vec!["javascript", "logging"]);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_add_keeps_supplied_tags_and_category() {
        let memory = TaskMemory::new(10);
        let item = memory.add(NewMemoryItem {
            tags: Some(vec!["Manual".into(), "parser".into()]),
            category: Some(Category::Docs),
            extra_tags: vec!["edit".into()],
            ..new_item("Fix the logging crash", Outcome::Success, &["main.js"])
        });
        assert_eq!(item.tags, vec!["Manual", "parser"]);
        assert_eq!(item.category, Category::Docs);

        let empty = memory.add(NewMemoryItem {
            tags: Some(Vec::new()),
            ..new_item("Fix the logging crash", Outcome::Success, &["main.js"])
        });
        assert!(empty.tags.is_empty());
    }

    #[test]
    fn test_cap_drops_oldest_first() {
        let memory = TaskMemory::new(3);
        let ids: Vec<String> = (0..5)
            .map(|n| memory.add(new_item(&format!("task {}", n), Outcome::Success, &[])).id)
            .collect();
        let kept: Vec<String> = memory.items().into_iter().map(|i| i.id).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[test]
    fn test_update_and_delete() {
        let memory = TaskMemory::new(10);
        let item = memory.add(new_item("add feature", Outcome::Partial, &[]));
        let updated = memory
            .update(
                &item.id,
                MemoryPatch {
                    outcome: Some(Outcome::Success),
                    summary: Some("done".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.outcome, Outcome::Success);
        assert!(updated.updated_at >= item.updated_at);
        assert!(memory.update("missing", MemoryPatch::default()).is_none());

        assert!(memory.delete(&item.id));
        assert!(!memory.delete(&item.id));
        assert!(memory.is_empty());
    }

    #[test]
    fn test_search_relevance_and_filters() {
        let memory = TaskMemory::new(10);
        memory.add(new_item("add logging to parser", Outcome::Success, &["parser.js"]));
        memory.add(new_item("fix parser crash", Outcome::Fail, &["parser.js"]));
        memory.add(new_item("style the header", Outcome::Success, &["style.css"]));

        let hits = memory.search(&MemoryFilter {
            query: Some("parser logging".into()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.goal, "add logging to parser");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);

        let failed = memory.search(&MemoryFilter {
            query: Some("parser".into()),
            outcome: Some(Outcome::Fail),
            ..Default::default()
        });
        assert_eq!(failed.len(), 1);

        let css = memory.search(&MemoryFilter {
            tags_any: vec!["css".into(), "python".into()],
            ..Default::default()
        });
        assert_eq!(css.len(), 1);
        assert_eq!(css[0].item.goal, "style the header");

        let none = memory.search(&MemoryFilter {
            query: Some("database".into()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_search_without_query_is_newest_first_and_limited() {
        let memory = TaskMemory::new(10);
        memory.add(new_item("first", Outcome::Success, &[]));
        memory.add(new_item("second", Outcome::Success, &[]));
        let hits = memory.search(&MemoryFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.goal, "second");
    }

    #[test]
    fn test_search_duration_range() {
        let memory = TaskMemory::new(10);
        let mut quick = new_item("quick", Outcome::Success, &[]);
        quick.duration_ms = 100;
        memory.add(quick);
        memory.add(new_item("slow", Outcome::Success, &[]));
        let hits = memory.search(&MemoryFilter {
            max_duration_ms: Some(500),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.goal, "quick");
    }

    #[test]
    fn test_related_scoring() {
        let memory = TaskMemory::new(10);
        let target = memory.add(new_item("fix parser crash", Outcome::Success, &["parser.js"]));
        let same_file = memory.add(new_item("fix parser again", Outcome::Fail, &["parser.js"]));
        let same_cat = memory.add(new_item("fix readme typo bug", Outcome::Success, &["README.md"]));
        memory.add(new_item("hmm", Outcome::Success, &[]));

        let related = memory.related(&target.id, 5);
        let ids: Vec<&str> = related.iter().map(|r| r.item.id.as_str()).collect();
        assert_eq!(ids, vec![same_file.id.as_str(), same_cat.id.as_str()]);
        // category + javascript tag + shared file
        assert_eq!(related[0].score, 2.0 + 1.0 + 1.5);
        assert_eq!(related[1].score, 2.0);
        assert!(related.iter().all(|r| r.item.id != target.id));

        assert_eq!(memory.related(&target.id, 1).len(), 1);
        assert!(memory.related("missing", 5).is_empty());
    }

    #[test]
    fn test_statistics() {
        let memory = TaskMemory::new(10);
        memory.add(new_item("fix a", Outcome::Success, &["a.js"]));
        memory.add(new_item("fix b", Outcome::Fail, &["a.js", "b.js"]));
        memory.add(new_item("add c", Outcome::Success, &["c.py"]));
        memory.add(new_item("add d", Outcome::Partial, &[]));

        let stats = memory.statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_outcome[&Outcome::Success], 2);
        assert_eq!(stats.by_category[&Category::Bugfix], 2);
        assert_eq!(stats.by_category[&Category::Feature], 2);
        assert_eq!(stats.average_duration_ms, 1000.0);
        assert_eq!(stats.total_tokens, 40);
        assert_eq!(stats.top_files[0], ("a.js".to_string(), 2));
        assert_eq!(stats.top_tags[0], ("javascript".to_string(), 2));
        assert_eq!(stats.success_rate, 0.5);

        assert_eq!(TaskMemory::new(3).statistics().success_rate, 0.0);
    }

    #[test]
    fn test_export_import_merge_and_replace() {
        let source = TaskMemory::new(10);
        let a = source.add(new_item("task a", Outcome::Success, &[]));
        source.add(new_item("task b", Outcome::Success, &[]));
        let exported = source.export().unwrap();

        let target = TaskMemory::new(10);
        target.add(new_item("local", Outcome::Fail, &[]));
        let report = target.import(&exported, ImportMode::Merge).unwrap();
        assert_eq!(report, ImportReport { added: 2, updated: 0, skipped: 0 });
        assert_eq!(target.len(), 3);

        let again = target.import(&exported, ImportMode::Merge).unwrap();
        assert_eq!(again.skipped, 2);

        source.update(&a.id, MemoryPatch { summary: Some("newer".into()), ..Default::default() });
        let newer = target.import(&source.export().unwrap(), ImportMode::Merge).unwrap();
        assert_eq!(newer.updated, 1);
        assert_eq!(target.get(&a.id).unwrap().summary, "newer");

        let replaced = target.import(&exported, ImportMode::Replace).unwrap();
        assert_eq!(replaced.added, 2);
        assert_eq!(target.len(), 2);

        assert!(target.import("not json", ImportMode::Merge).is_err());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory/tasks.json");
        {
            let memory = TaskMemory::open(&path, 10).unwrap();
            memory.add(new_item("persist me", Outcome::Success, &[]));
        }
        let reopened = TaskMemory::open(&path, 10).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.items()[0].goal, "persist me");
    }

    #[test]
    fn test_add_publishes_memory_added() {
        let bus = EventBus::default();
        let memory = TaskMemory::new(10).with_bus(bus.clone());
        memory.add(new_item("x", Outcome::Partial, &[]));
        assert_eq!(bus.history(&HistoryFilter::kind(EventKind::MemoryAdded)).len(), 1);
    }
}
