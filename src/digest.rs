//! Plain-text digest of recent log entries.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::event_log::{parse_timestamp, EventLog};

#[derive(Debug, Clone, PartialEq)]
pub struct DigestReport {
    pub entries: usize,
    /// Set only when a file was written.
    pub output: Option<PathBuf>,
}

/// Write every entry newer than `now - days` to `output`, one
/// `[timestamp] summary` line each. Nothing is written when no entry qualifies.
pub fn generate_digest(
    log: &EventLog,
    days: i64,
    output: &Path,
    now: DateTime<Utc>,
) -> Result<DigestReport> {
    let cutoff = now - Duration::days(days);

    let mut lines = Vec::new();
    for entry in log.entries()? {
        let Some(ts) = parse_timestamp(&entry.timestamp) else {
            warn!(
                "skipping entry with unparsable timestamp '{}' ({})",
                entry.timestamp, entry.source
            );
            continue;
        };
        if ts > cutoff {
            let summary = entry.summary.split_whitespace().collect::<Vec<_>>().join(" ");
            lines.push(format!("[{}] {}", entry.timestamp, summary));
        }
    }

    if lines.is_empty() {
        return Ok(DigestReport {
            entries: 0,
            output: None,
        });
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(output, body)
        .with_context(|| format!("Failed to write digest: {}", output.display()))?;

    Ok(DigestReport {
        entries: lines.len(),
        output: Some(output.to_path_buf()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(path: &Path, lines: &[(&str, &str)]) {
        let body: String = lines
            .iter()
            .map(|(ts, summary)| {
                format!(
                    "{}\n",
                    serde_json::json!({
                        "timestamp": ts,
                        "source": "workspace/a.txt",
                        "type": "summary",
                        "summary": summary
                    })
                )
            })
            .collect();
        std::fs::write(path, body).unwrap();
    }

    fn now() -> DateTime<Utc> {
        parse_timestamp("2024-05-10T12:00:00Z").unwrap()
    }

    #[test]
    fn keeps_only_recent_entries() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("log.jsonl");
        write_log(
            &log_path,
            &[
                ("2024-05-01T00:00:00.000000Z", "old"),
                ("2024-05-10T08:00:00.000000", "naive\nmultiline"),
                ("garbage", "skipped"),
                ("2024-05-10T11:00:00.000000Z", "recent"),
            ],
        );
        let out = tmp.path().join("outputs/digest.txt");

        let report = generate_digest(&EventLog::new(&log_path), 1, &out, now()).unwrap();
        assert_eq!(report.entries, 2);
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            text,
            "[2024-05-10T08:00:00.000000] naive multiline\n[2024-05-10T11:00:00.000000Z] recent\n"
        );
    }

    #[test]
    fn nothing_recent_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("log.jsonl");
        write_log(&log_path, &[("2020-01-01T00:00:00Z", "ancient")]);
        let out = tmp.path().join("outputs/digest.txt");

        let report = generate_digest(&EventLog::new(&log_path), 1, &out, now()).unwrap();
        assert_eq!(report.entries, 0);
        assert!(report.output.is_none());
        assert!(!out.exists());
    }
}
