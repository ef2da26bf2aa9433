//! Full-sync progress reporting.
//!
//! Reports what `wsm sync` / `wsm watch` are doing during the startup scan so
//! users can see how many files are left to summarize. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a full sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Walking the workspace tree. Total unknown.
    Scanning { root: String },
    /// Summarizing changed file `n` of `total`.
    Summarizing { source: String, n: u64, total: u64 },
    /// Pass finished.
    Finished {
        summarized: u64,
        deleted: u64,
        unchanged: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync workspace  summarizing  12 / 1,034 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Scanning { root } => format!("sync {}  scanning...\n", root),
            SyncProgressEvent::Summarizing { source, n, total } => format!(
                "sync  summarizing  {} / {} files  {}\n",
                format_number(*n),
                format_number(*total),
                source
            ),
            SyncProgressEvent::Finished {
                summarized,
                deleted,
                unchanged,
            } => format!(
                "sync  done  {} summarized, {} deleted, {} unchanged\n",
                format_number(*summarized),
                format_number(*deleted),
                format_number(*unchanged)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &SyncProgressEvent) -> serde_json::Value {
        match event {
            SyncProgressEvent::Scanning { root } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root
            }),
            SyncProgressEvent::Summarizing { source, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "summarizing",
                "source": source,
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Finished {
                summarized,
                deleted,
                unchanged,
            } => serde_json::json!({
                "event": "progress",
                "phase": "finished",
                "summarized": summarized,
                "deleted": deleted,
                "unchanged": unchanged
            }),
        }
    }
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
