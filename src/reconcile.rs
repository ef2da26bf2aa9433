//! Reconciliation loop: the single writer of the event log and path state.
//!
//! ```text
//! Idle ──full_sync──▶ FullSync ──▶ Watching ──cancel──▶ Stopped
//! ```
//!
//! A full sync runs once at startup: the change detector compares the tree
//! against the persisted path state, deletions and fresh summaries are
//! appended to the log, and each new entry is upserted into the index. The
//! loop then consumes [`WorkspaceEvent`]s from the watcher queue one at a
//! time. Every method takes `&mut self`, so a full sync and a handler can
//! never interleave their read-modify-write of the path state.
//!
//! Cancellation is only observed between events: a handler that has started
//! always finishes before the watcher is dropped.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::changes::{compute_changes, file_mtime, root_label, ChangeSet, ScanFilter};
use crate::config::Config;
use crate::event_log::EventLog;
use crate::index_sync::{IndexSynchronizer, UpsertOutcome};
use crate::models::{EntryKind, LogEntry};
use crate::path_state::{round_mtime, PathState, PathStore};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::summarize::Summarizer;
use crate::watcher::{FileWatcher, WorkspaceEvent};
use crate::workspace_path::WorkspacePath;

/// Summary logged for every deletion.
pub const DELETION_SUMMARY: &str = "File was deleted";

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    FullSync,
    Watching,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub summarized: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Changed files that produced no summary (empty, unreadable, service down).
    pub skipped: usize,
    /// Summarized files whose key is not a valid workspace path.
    pub untracked: usize,
    pub index_failures: usize,
}

/// What a single watcher event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Summarized,
    /// Summarized and logged, but the key was not recorded in the path state.
    SummarizedUntracked,
    Deleted(usize),
    /// A directory appeared; the count is how many files below it were
    /// summarized.
    Directory(usize),
    /// mtime not newer than the recorded one.
    Unchanged,
    /// No summary produced.
    Skipped,
    /// Outside the root, excluded, or already absent from the path state.
    Ignored,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub root: PathBuf,
    pub filter: ScanFilter,
    pub debounce: Duration,
    pub prune_on_start: bool,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.workspace.root.clone(),
            filter: ScanFilter::from_config(&config.workspace)?,
            debounce: Duration::from_millis(config.watch.debounce_ms),
            prune_on_start: config.index.prune_on_start,
        })
    }
}

pub struct Reconciler {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    label: String,
    filter: ScanFilter,
    debounce: Duration,
    prune_on_start: bool,
    state_store: PathStore,
    log: EventLog,
    sync: IndexSynchronizer,
    summarizer: Summarizer,
    progress: Box<dyn SyncProgressReporter>,
    state: LoopState,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        state_store: PathStore,
        log: EventLog,
        sync: IndexSynchronizer,
        summarizer: Summarizer,
    ) -> Self {
        let label = root_label(&settings.root);
        let canonical_root = settings.root.canonicalize().ok();
        Self {
            root: settings.root,
            canonical_root,
            label,
            filter: settings.filter,
            debounce: settings.debounce,
            prune_on_start: settings.prune_on_start,
            state_store,
            log,
            sync,
            summarizer,
            progress: Box::new(NoProgress),
            state: LoopState::Idle,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn synchronizer(&self) -> &IndexSynchronizer {
        &self.sync
    }

    /// Scan the workspace once and bring log, path state and index up to date.
    pub async fn full_sync(&mut self) -> Result<SyncReport> {
        self.state = LoopState::FullSync;
        let result = self.full_sync_pass().await;
        self.state = LoopState::Idle;
        result
    }

    async fn full_sync_pass(&mut self) -> Result<SyncReport> {
        self.progress.report(SyncProgressEvent::Scanning {
            root: self.root.display().to_string(),
        });

        let mut state = self.state_store.load()?;
        let changes = compute_changes(&self.root, &self.filter, &state)?;
        let mut report = SyncReport {
            unchanged: changes.unchanged,
            ..SyncReport::default()
        };

        // Whatever was logged before a failure must be persisted, or the next
        // pass would log the same transitions again.
        let applied = self.apply_changes(&changes, &mut state, &mut report).await;
        self.state_store.save(&state)?;
        applied?;

        self.progress.report(SyncProgressEvent::Finished {
            summarized: report.summarized as u64,
            deleted: report.deleted as u64,
            unchanged: report.unchanged as u64,
        });
        info!(
            "sync complete: {} summarized, {} deleted, {} unchanged, {} skipped",
            report.summarized, report.deleted, report.unchanged, report.skipped
        );
        Ok(report)
    }

    /// Log every change in `changes`. `state` is updated only after the
    /// matching entry was appended.
    async fn apply_changes(
        &self,
        changes: &ChangeSet,
        state: &mut PathState,
        report: &mut SyncReport,
    ) -> Result<()> {
        for path in &changes.deleted {
            info!("removing deleted file from state: {}", path);
            let entry = self
                .log
                .append(DELETION_SUMMARY, path.as_str(), EntryKind::Deletion)?;
            state.remove(path.as_str());
            self.index_entry(&entry, report).await;
            report.deleted += 1;
        }

        let total = changes.modified.len() as u64;
        for (i, file) in changes.modified.iter().enumerate() {
            self.progress.report(SyncProgressEvent::Summarizing {
                source: file.source.clone(),
                n: i as u64 + 1,
                total,
            });

            let Some(summary) = self.summarizer.summarize(&file.absolute).await else {
                report.skipped += 1;
                continue;
            };
            let entry = self.log.append(&summary, &file.source, EntryKind::Summary)?;
            match &file.path {
                Some(path) => state.record(path.clone(), file.modified_at),
                None => report.untracked += 1,
            }
            self.index_entry(&entry, report).await;
            report.summarized += 1;
        }
        Ok(())
    }

    async fn index_entry(&self, entry: &LogEntry, report: &mut SyncReport) {
        if let UpsertOutcome::Failed(_) = self.sync.upsert(entry).await {
            report.index_failures += 1;
        }
    }

    /// Post-sync upkeep: prune orphaned index rows when enabled.
    pub async fn maintenance(&self) {
        if !self.prune_on_start {
            return;
        }
        if let Err(e) = self.sync.prune_orphans(&self.log).await {
            warn!("orphan pruning failed: {:#}", e);
        }
    }

    /// Full sync, then process watcher events until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.full_sync().await?;
        self.maintenance().await;

        if cancel.is_cancelled() {
            self.state = LoopState::Stopped;
            return Ok(());
        }

        let watch_root = self
            .root
            .canonicalize()
            .with_context(|| format!("Workspace root does not exist: {}", self.root.display()))?;
        self.canonical_root = Some(watch_root.clone());

        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut watcher = FileWatcher::new(tx, self.debounce)?;
        watcher
            .watch(&watch_root)
            .with_context(|| format!("Failed to watch {}", watch_root.display()))?;
        self.state = LoopState::Watching;
        info!("watching {} for changes", watch_root.display());

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            // Not raced against cancellation.
            let outcome = self.handle_event(event).await;
            debug!("event handled: {:?}", outcome);
        }

        drop(watcher);
        self.state = LoopState::Stopped;
        info!("watcher stopped");
        Ok(())
    }

    /// Apply one watcher event. Errors are logged and reported, never raised.
    pub async fn handle_event(&mut self, event: WorkspaceEvent) -> EventOutcome {
        let result = match &event {
            WorkspaceEvent::Created(path) if path.is_dir() => self.handle_directory(path).await,
            WorkspaceEvent::Created(path) | WorkspaceEvent::Modified(path) => {
                self.handle_file(path).await
            }
            WorkspaceEvent::Deleted(path) => self.handle_delete(path).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("failed to handle {:?}: {:#}", event, e);
                EventOutcome::Failed(e.to_string())
            }
        }
    }

    /// A directory moved or renamed into place brings files that get no
    /// event of their own.
    async fn handle_directory(&mut self, dir: &Path) -> Result<EventOutcome> {
        if self.locate(dir).is_none() {
            return Ok(EventOutcome::Ignored);
        }
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(self.filter.follows_symlinks())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        let mut summarized = 0;
        for file in &files {
            match self.handle_file(file).await? {
                EventOutcome::Summarized | EventOutcome::SummarizedUntracked => summarized += 1,
                other => debug!("{}: {:?}", file.display(), other),
            }
        }
        Ok(EventOutcome::Directory(summarized))
    }

    async fn handle_file(&mut self, path: &Path) -> Result<EventOutcome> {
        let Some((source, relative)) = self.locate(path) else {
            return Ok(EventOutcome::Ignored);
        };
        if self.filter.excludes(&relative) || !path.is_file() {
            return Ok(EventOutcome::Ignored);
        }
        let Some(mtime) = file_mtime(path) else {
            return Ok(EventOutcome::Ignored);
        };

        let workspace_path = match WorkspacePath::parse(&source) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("{}; it will be summarized but not tracked", e);
                None
            }
        };

        if let Some(ref p) = workspace_path {
            let state = self.state_store.load()?;
            if let Some(stored) = state.get(p.as_str()) {
                if mtime <= round_mtime(stored) {
                    return Ok(EventOutcome::Unchanged);
                }
            }
        }

        info!("detected change in {}", source);
        let Some(summary) = self.summarizer.summarize(path).await else {
            return Ok(EventOutcome::Skipped);
        };
        let entry = self.log.append(&summary, &source, EntryKind::Summary)?;
        self.sync.upsert(&entry).await;

        let Some(p) = workspace_path else {
            return Ok(EventOutcome::SummarizedUntracked);
        };
        // Reload so a concurrent writer's records are not clobbered.
        let mut state = self.state_store.load()?;
        state.record(p, mtime);
        self.state_store.save(&state)?;
        Ok(EventOutcome::Summarized)
    }

    async fn handle_delete(&mut self, path: &Path) -> Result<EventOutcome> {
        let Some((source, _)) = self.locate(path) else {
            return Ok(EventOutcome::Ignored);
        };

        let mut state = self.state_store.load()?;
        // A removed directory takes every tracked file below it.
        let prefix = format!("{}/", source);
        let removed: Vec<WorkspacePath> = state
            .paths()
            .filter(|p| p.as_str() == source || p.as_str().starts_with(&prefix))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(EventOutcome::Ignored);
        }

        for p in &removed {
            state.remove(p.as_str());
        }
        self.state_store.save(&state)?;

        for p in &removed {
            info!("detected deletion: {}", p);
            let entry = self
                .log
                .append(DELETION_SUMMARY, p.as_str(), EntryKind::Deletion)?;
            self.sync.upsert(&entry).await;
        }
        Ok(EventOutcome::Deleted(removed.len()))
    }

    /// Key and root-relative path for an event path, if it lies under the root.
    fn locate(&self, path: &Path) -> Option<(String, PathBuf)> {
        let roots = std::iter::once(&self.root).chain(self.canonical_root.as_ref());
        for root in roots {
            if let Ok(relative) = path.strip_prefix(root) {
                let rel_str = relative.to_string_lossy().replace('\\', "/");
                if rel_str.is_empty() {
                    return None;
                }
                return Some((format!("{}/{}", self.label, rel_str), relative.to_path_buf()));
            }
        }
        None
    }

    /// Release the index handle.
    pub async fn shutdown(self) {
        self.sync.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completer, CompletionRequest};
    use crate::embedding::Embedder;
    use crate::index::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl Completer for Echo {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            Ok(format!("summary of {} chars", request.prompt.len()))
        }
    }

    struct Unit;

    #[async_trait]
    impl Embedder for Unit {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    async fn reconciler(tmp: &TempDir) -> Reconciler {
        reconciler_with(tmp, Arc::new(Echo)).await
    }

    async fn reconciler_with(tmp: &TempDir, completer: Arc<dyn Completer>) -> Reconciler {
        let root = tmp.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();
        let sync = IndexSynchronizer::new(Arc::new(InMemoryStorage::new()), Arc::new(Unit))
            .await
            .unwrap();
        let settings = ReconcilerSettings {
            root,
            filter: ScanFilter::new(vec![".gitignore".to_string()], &[], false).unwrap(),
            debounce: Duration::from_millis(50),
            prune_on_start: true,
        };
        Reconciler::new(
            settings,
            PathStore::new(tmp.path().join("memory/last_seen.json")),
            EventLog::new(tmp.path().join("memory/log.jsonl")),
            sync,
            Summarizer::new(completer, 1000),
        )
    }

    /// Replaces the log file with a directory on its first call, so the next
    /// append fails. `restore` puts the log back.
    struct LogBreaker {
        log_path: PathBuf,
        saved: std::sync::Mutex<Option<String>>,
    }

    impl LogBreaker {
        fn restore(&self) {
            let saved = self.saved.lock().unwrap().clone().unwrap();
            std::fs::remove_dir(&self.log_path).unwrap();
            std::fs::write(&self.log_path, saved).unwrap();
        }
    }

    #[async_trait]
    impl Completer for LogBreaker {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            let mut saved = self.saved.lock().unwrap();
            if saved.is_none() {
                *saved = Some(std::fs::read_to_string(&self.log_path).unwrap());
                std::fs::remove_file(&self.log_path).unwrap();
                std::fs::create_dir(&self.log_path).unwrap();
            }
            Ok("alpha notes".to_string())
        }
    }

    #[tokio::test]
    async fn full_sync_returns_to_idle() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("workspace")).unwrap();
        std::fs::write(tmp.path().join("workspace/a.txt"), "alpha").unwrap();
        let mut r = reconciler(&tmp).await;

        assert_eq!(r.state(), LoopState::Idle);
        let report = r.full_sync().await.unwrap();
        assert_eq!(r.state(), LoopState::Idle);
        assert_eq!(report.summarized, 1);

        let second = r.full_sync().await.unwrap();
        assert_eq!(second.summarized, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn failed_append_keeps_earlier_transitions() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("workspace")).unwrap();
        std::fs::write(tmp.path().join("workspace/a.txt"), "alpha").unwrap();
        let store = PathStore::new(tmp.path().join("memory/last_seen.json"));
        let mut prior = PathState::new();
        prior.record(WorkspacePath::parse("workspace/gone.txt").unwrap(), 100.0);
        store.save(&prior).unwrap();

        let breaker = Arc::new(LogBreaker {
            log_path: tmp.path().join("memory/log.jsonl"),
            saved: std::sync::Mutex::new(None),
        });
        let mut r = reconciler_with(&tmp, breaker.clone()).await;

        // The deletion is appended, then the summary append hits the directory.
        assert!(r.full_sync().await.is_err());
        assert_eq!(r.state(), LoopState::Idle);
        assert!(!store.load().unwrap().contains("workspace/gone.txt"));

        breaker.restore();
        let report = r.full_sync().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.summarized, 1);

        let deletions = r
            .log()
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Deletion && e.source == "workspace/gone.txt")
            .count();
        assert_eq!(deletions, 1);
    }

    #[tokio::test]
    async fn events_outside_root_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut r = reconciler(&tmp).await;
        let outcome = r
            .handle_event(WorkspaceEvent::Modified(tmp.path().join("elsewhere.txt")))
            .await;
        assert_eq!(outcome, EventOutcome::Ignored);
    }

    #[tokio::test]
    async fn cancelled_run_stops_after_sync() {
        let tmp = TempDir::new().unwrap();
        let mut r = reconciler(&tmp).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        r.run(cancel).await.unwrap();
        assert_eq!(r.state(), LoopState::Stopped);
    }
}
