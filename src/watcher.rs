//! Filesystem watcher feeding the reconciliation loop.
//!
//! Debounced notifications from `notify-debouncer-full` are converted into
//! [`WorkspaceEvent`]s and pushed onto a bounded tokio channel with a single
//! consumer. Filtering (ignored extensions, excluded globs) is left to the
//! consumer so the watcher and the change detector share one rule set.

use notify_debouncer_full::notify::event::{ModifyKind, RenameMode};
use notify_debouncer_full::notify::{self, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache,
};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, warn};

/// A filesystem change as seen by the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl WorkspaceEvent {
    pub fn path(&self) -> &Path {
        match self {
            WorkspaceEvent::Created(p) | WorkspaceEvent::Modified(p) | WorkspaceEvent::Deleted(p) => p,
        }
    }
}

/// Debounced recursive watcher. Dropping it ends the subscription.
pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    pub fn new(
        event_tx: tokio_mpsc::Sender<WorkspaceEvent>,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            while let Ok(result) = rx.recv() {
                if !forward_events(result, &event_tx) {
                    break;
                }
            }
        });

        let debouncer = new_debouncer(debounce, None, move |result| {
            let _ = tx.send(result);
        })?;

        Ok(Self { debouncer })
    }

    pub fn watch(&mut self, path: &Path) -> Result<(), notify::Error> {
        debug!("watching {}", path.display());
        self.debouncer.watch(path, RecursiveMode::Recursive)
    }
}

/// Returns false once the receiving side is gone.
fn forward_events(
    result: DebounceEventResult,
    event_tx: &tokio_mpsc::Sender<WorkspaceEvent>,
) -> bool {
    match result {
        Ok(events) => {
            for event in events {
                for converted in convert_event(&event) {
                    // Plain std thread, so a blocking send.
                    if event_tx.blocking_send(converted).is_err() {
                        warn!("workspace event channel closed");
                        return false;
                    }
                }
            }
        }
        Err(errors) => {
            for e in errors {
                error!("watch error: {}", e);
            }
        }
    }
    true
}

fn convert_event(event: &DebouncedEvent) -> Vec<WorkspaceEvent> {
    let paths = &event.event.paths;
    let Some(first) = paths.first().cloned() else {
        return Vec::new();
    };

    match &event.event.kind {
        EventKind::Create(_) => vec![WorkspaceEvent::Created(first)],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![WorkspaceEvent::Deleted(first)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![WorkspaceEvent::Created(first)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => vec![
            WorkspaceEvent::Deleted(first),
            WorkspaceEvent::Created(paths[1].clone()),
        ],
        EventKind::Modify(_) => vec![WorkspaceEvent::Modified(first)],
        EventKind::Remove(_) => vec![WorkspaceEvent::Deleted(first)],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_debouncer_full::notify::event::{CreateKind, DataChange, RemoveKind};
    use std::time::Instant;

    fn make_event(kind: EventKind, paths: Vec<PathBuf>) -> DebouncedEvent {
        DebouncedEvent {
            event: notify::Event {
                kind,
                paths,
                attrs: Default::default(),
            },
            time: Instant::now(),
        }
    }

    #[test]
    fn create_modify_remove() {
        let path = PathBuf::from("/tmp/workspace/a.txt");
        assert_eq!(
            convert_event(&make_event(EventKind::Create(CreateKind::File), vec![path.clone()])),
            vec![WorkspaceEvent::Created(path.clone())]
        );
        assert_eq!(
            convert_event(&make_event(
                EventKind::Modify(ModifyKind::Data(DataChange::Any)),
                vec![path.clone()]
            )),
            vec![WorkspaceEvent::Modified(path.clone())]
        );
        assert_eq!(
            convert_event(&make_event(EventKind::Remove(RemoveKind::File), vec![path.clone()])),
            vec![WorkspaceEvent::Deleted(path)]
        );
    }

    #[test]
    fn rename_is_delete_then_create() {
        let from = PathBuf::from("/tmp/workspace/old.txt");
        let to = PathBuf::from("/tmp/workspace/new.txt");
        let events = convert_event(&make_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![from.clone(), to.clone()],
        ));
        assert_eq!(
            events,
            vec![WorkspaceEvent::Deleted(from), WorkspaceEvent::Created(to)]
        );
    }

    #[test]
    fn access_events_are_dropped() {
        let event = make_event(
            EventKind::Access(notify::event::AccessKind::Any),
            vec![PathBuf::from("/tmp/workspace/a.txt")],
        );
        assert!(convert_event(&event).is_empty());
    }

    #[tokio::test]
    async fn forwards_until_receiver_closes() {
        let (tx, mut rx) = tokio_mpsc::channel(8);
        let path = PathBuf::from("/tmp/workspace/a.txt");
        let batch = vec![make_event(EventKind::Remove(RemoveKind::File), vec![path.clone()])];

        let handle = std::thread::spawn(move || forward_events(Ok(batch), &tx));
        assert!(handle.join().unwrap());
        assert_eq!(rx.recv().await, Some(WorkspaceEvent::Deleted(path)));
    }
}
