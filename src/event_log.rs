//! Append-only event log.
//!
//! The log (`log.jsonl`) is the single source of truth: one JSON record per
//! line, `{timestamp, source, type, summary}`, never rewritten. The vector
//! index is derived from it and can always be rebuilt by replaying it.
//!
//! Each [`EventLog`] hands out strictly increasing timestamps, so the
//! `timestamp_source` identity of two events on the same file can never
//! collide within one writer.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::models::{EntryKind, LogEntry};

/// One line read back from the log.
#[derive(Debug, Clone)]
pub enum ReplayLine {
    Entry(LogEntry),
    Malformed { line_no: usize, error: String },
}

/// Handle to the log file. Cheap to construct; the file is opened per call.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_stamp: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and return the record exactly as written.
    ///
    /// Fails if the record could not be durably written; the caller must treat
    /// the event as unrecorded.
    pub fn append(&self, summary: &str, source: &str, kind: EntryKind) -> Result<LogEntry> {
        let entry = LogEntry {
            timestamp: self.next_timestamp()?,
            source: source.to_string(),
            kind,
            summary: summary.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open event log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to event log: {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("Failed to sync event log: {}", self.path.display()))?;

        Ok(entry)
    }

    fn next_timestamp(&self) -> Result<String> {
        let mut last = self
            .last_stamp
            .lock()
            .map_err(|_| anyhow::anyhow!("event log timestamp lock poisoned"))?;
        if last.is_none() {
            *last = self.last_recorded_instant()?;
        }

        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        Ok(now.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    fn last_recorded_instant(&self) -> Result<Option<DateTime<Utc>>> {
        let mut latest = None;
        for line in self.replay()? {
            if let ReplayLine::Entry(entry) = line {
                if let Some(ts) = parse_timestamp(&entry.timestamp) {
                    latest = Some(latest.map_or(ts, |l: DateTime<Utc>| l.max(ts)));
                }
            }
        }
        Ok(latest)
    }

    /// Read the whole log in file order. A missing file replays as empty.
    pub fn replay(&self) -> Result<Vec<ReplayLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open event log: {}", self.path.display()))?;

        let mut lines = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .with_context(|| format!("Failed to read event log: {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => lines.push(ReplayLine::Entry(entry)),
                Err(e) => lines.push(ReplayLine::Malformed {
                    line_no: i + 1,
                    error: e.to_string(),
                }),
            }
        }
        Ok(lines)
    }

    /// Valid entries in file order; malformed lines are warned about and skipped.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for line in self.replay()? {
            match line {
                ReplayLine::Entry(entry) => entries.push(entry),
                ReplayLine::Malformed { line_no, error } => {
                    warn!(
                        "skipping malformed log line {} in {}: {}",
                        line_no,
                        self.path.display(),
                        error
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Every identity derivable from the log.
    pub fn identities(&self) -> Result<HashSet<String>> {
        Ok(self.entries()?.iter().map(LogEntry::id).collect())
    }
}

/// Parse a log timestamp: RFC 3339, or a naive ISO datetime taken as UTC.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_creates_directory_and_writes_one_line() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("memory/log.jsonl"));

        let entry = log.append("notes about rust", "workspace/a.txt", EntryKind::Summary).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with('\n'));
        let parsed: LogEntry = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed, entry);
        assert!(entry.timestamp.ends_with('Z'));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("log.jsonl"));

        let ids: Vec<String> = (0..50)
            .map(|_| log.append("s", "workspace/a.txt", EntryKind::Summary).unwrap().id())
            .collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn new_writer_continues_after_existing_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        std::fs::write(
            &path,
            "{\"timestamp\":\"2999-01-01T00:00:00.000000Z\",\"source\":\"workspace/a.txt\",\"type\":\"summary\",\"summary\":\"future\"}\n",
        )
        .unwrap();

        let entry = EventLog::new(&path)
            .append("s", "workspace/a.txt", EntryKind::Summary)
            .unwrap();
        assert_eq!(entry.timestamp, "2999-01-01T00:00:00.000001Z");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let log = EventLog::new(&path);
        log.append("first", "workspace/a.txt", EntryKind::Summary).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        log.append("gone", "workspace/a.txt", EntryKind::Deletion).unwrap();

        let replay = log.replay().unwrap();
        assert_eq!(replay.len(), 3);
        assert!(matches!(replay[1], ReplayLine::Malformed { line_no: 2, .. }));

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Deletion);
    }

    #[test]
    fn missing_log_replays_empty() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("absent.jsonl"));
        assert!(log.entries().unwrap().is_empty());
        assert!(log.identities().unwrap().is_empty());
    }

    #[test]
    fn parses_legacy_naive_timestamps() {
        let ts = parse_timestamp("2024-05-01T10:00:00.123456").unwrap();
        assert_eq!(ts.to_rfc3339_opts(SecondsFormat::Micros, true), "2024-05-01T10:00:00.123456Z");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
