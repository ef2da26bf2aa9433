//! Keeps the vector index consistent with the event log.
//!
//! Three operations move the index toward the log:
//!
//! - **Incremental upsert** of a single entry right after it was appended.
//! - **Orphan pruning**: rows whose id no longer derives from any log line
//!   are deleted.
//! - **Full resync**: the index storage is destroyed and rebuilt by replaying
//!   the log from the start.
//!
//! Upserts are keyed by the entry's `timestamp_source` identity, so
//! repeating one is harmless.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedding::{embed_one, Embedder};
use crate::event_log::{EventLog, ReplayLine};
use crate::index::{IndexStorage, VectorIndex};
use crate::models::{IndexEntry, LogEntry, StoredEntry};

/// Result of projecting one log entry into the index.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Indexed,
    /// Nothing to embed (empty summary).
    Skipped,
    /// Embedding or index write failed; the entry stays only in the log.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub examined: usize,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResyncReport {
    pub replayed: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub malformed: usize,
}

/// Owns the open index handle and the embedder used to fill it.
pub struct IndexSynchronizer {
    storage: Arc<dyn IndexStorage>,
    embedder: Arc<dyn Embedder>,
    index: Box<dyn VectorIndex>,
}

impl IndexSynchronizer {
    pub async fn new(storage: Arc<dyn IndexStorage>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let index = storage.open().await?;
        Ok(Self {
            storage,
            embedder,
            index,
        })
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Embed `entry.summary` and write it under `entry.id()`.
    ///
    /// Never fails the caller: problems are logged and reported in the outcome.
    pub async fn upsert(&self, entry: &LogEntry) -> UpsertOutcome {
        if entry.summary.trim().is_empty() {
            debug!("skipping index upsert for {}: empty summary", entry.source);
            return UpsertOutcome::Skipped;
        }

        let vector = match embed_one(self.embedder.as_ref(), &entry.summary).await {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to embed entry {}: {:#}", entry.id(), e);
                return UpsertOutcome::Failed(format!("embedding failed: {}", e));
            }
        };

        match self.index.add(&[IndexEntry::from_log(entry, vector)]).await {
            Ok(()) => UpsertOutcome::Indexed,
            Err(e) => {
                warn!("failed to index entry {}: {:#}", entry.id(), e);
                UpsertOutcome::Failed(format!("index write failed: {}", e))
            }
        }
    }

    /// Delete index rows whose id is not derivable from the log.
    pub async fn prune_orphans(&self, log: &EventLog) -> Result<PruneReport> {
        let rows = match self.index.get().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("could not list index rows, skipping prune: {:#}", e);
                return Ok(PruneReport::default());
            }
        };
        let valid = log.identities()?;

        let removed: Vec<String> = rows
            .iter()
            .filter(|row| !valid.contains(&row.id))
            .map(|row| row.id.clone())
            .collect();

        if !removed.is_empty() {
            self.index.delete(&removed).await?;
            info!("pruned {} orphaned index rows", removed.len());
        }

        Ok(PruneReport {
            examined: rows.len(),
            removed,
        })
    }

    /// Destroy the index and rebuild it from the log.
    pub async fn full_resync(&mut self, log: &EventLog) -> Result<ResyncReport> {
        // Any handle must be released before the files underneath go away.
        self.index.close().await;

        if let Err(e) = self.storage.destroy().await {
            self.reopen_after_failure().await;
            return Err(e);
        }
        match self.storage.open().await {
            Ok(index) => self.index = index,
            Err(e) => {
                self.reopen_after_failure().await;
                return Err(e);
            }
        }
        info!("index storage reset: {}", self.storage.describe());

        let mut report = ResyncReport::default();
        for line in log.replay()? {
            match line {
                ReplayLine::Entry(entry) => {
                    report.replayed += 1;
                    match self.upsert(&entry).await {
                        UpsertOutcome::Indexed => report.indexed += 1,
                        UpsertOutcome::Skipped => report.skipped += 1,
                        UpsertOutcome::Failed(_) => report.failed += 1,
                    }
                }
                ReplayLine::Malformed { line_no, error } => {
                    warn!("skipping malformed log line {}: {}", line_no, error);
                    report.malformed += 1;
                }
            }
        }

        info!(
            "resync complete: {} replayed, {} indexed, {} failed",
            report.replayed, report.indexed, report.failed
        );
        Ok(report)
    }

    async fn reopen_after_failure(&mut self) {
        match self.storage.open().await {
            Ok(index) => self.index = index,
            Err(e) => warn!("could not reopen index storage: {:#}", e),
        }
    }

    pub async fn list(&self) -> Result<Vec<StoredEntry>> {
        self.index.get().await
    }

    pub async fn close(self) {
        self.index.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::index::InMemoryStorage;
    use crate::models::EntryKind;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    async fn sync_with(embedder: Arc<dyn Embedder>) -> IndexSynchronizer {
        IndexSynchronizer::new(Arc::new(InMemoryStorage::new()), embedder)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));
        let sync = sync_with(Arc::new(LengthEmbedder)).await;

        let entry = log.append("hello", "workspace/a.txt", EntryKind::Summary).unwrap();
        assert_eq!(sync.upsert(&entry).await, UpsertOutcome::Indexed);
        assert_eq!(sync.upsert(&entry).await, UpsertOutcome::Indexed);
        assert_eq!(sync.index().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_summary_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));
        let sync = sync_with(Arc::new(LengthEmbedder)).await;

        let entry = log.append("  ", "workspace/a.txt", EntryKind::Summary).unwrap();
        assert_eq!(sync.upsert(&entry).await, UpsertOutcome::Skipped);
        assert_eq!(sync.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn embedding_failure_is_reported_not_raised() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));
        let sync = sync_with(Arc::new(DisabledProvider)).await;

        let entry = log.append("hello", "workspace/a.txt", EntryKind::Summary).unwrap();
        assert!(matches!(sync.upsert(&entry).await, UpsertOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn prune_removes_only_orphans() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));
        let sync = sync_with(Arc::new(LengthEmbedder)).await;

        let kept = log.append("kept", "workspace/a.txt", EntryKind::Summary).unwrap();
        sync.upsert(&kept).await;
        let orphan = LogEntry {
            timestamp: "2020-01-01T00:00:00.000000Z".to_string(),
            source: "workspace/gone.txt".to_string(),
            kind: EntryKind::Summary,
            summary: "never logged".to_string(),
        };
        sync.upsert(&orphan).await;

        let report = sync.prune_orphans(&log).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.removed, vec![orphan.id()]);
        let ids: Vec<String> = sync.list().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![kept.id()]);
    }

    #[tokio::test]
    async fn resync_rebuilds_from_log() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));
        let mut sync = sync_with(Arc::new(LengthEmbedder)).await;

        log.append("one", "workspace/a.txt", EntryKind::Summary).unwrap();
        log.append("two", "workspace/b.txt", EntryKind::Summary).unwrap();
        log.append("File was deleted", "workspace/a.txt", EntryKind::Deletion).unwrap();

        let report = sync.full_resync(&log).await.unwrap();
        assert_eq!(report.replayed, 3);
        assert_eq!(report.indexed, 3);
        assert_eq!(sync.index().count().await.unwrap(), 3);
    }
}
