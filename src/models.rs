//! Core data models used throughout Workspace Memory.
//!
//! These types represent the log entries, index rows, and retrieval hits that
//! flow between the event log, the index synchronizer, and the answering
//! pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of event recorded in the log.
///
/// Older logs spell deletions as `"deleted"` and some lines carry no `type`
/// field at all; both are accepted on read and normalised on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    #[serde(alias = "summarized", alias = "modified", alias = "created")]
    Summary,
    #[serde(alias = "deleted", alias = "delete", alias = "removed")]
    Deletion,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Summary => "summary",
            EntryKind::Deletion => "deletion",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" | "summarized" | "modified" | "created" => Ok(EntryKind::Summary),
            "deletion" | "deleted" | "delete" | "removed" => Ok(EntryKind::Deletion),
            other => anyhow::bail!(
                "Unknown entry type: '{}'. Must be summary or deletion.",
                other
            ),
        }
    }
}

/// One immutable record of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp, stamped at append time.
    pub timestamp: String,
    /// Workspace-relative path the event is about.
    pub source: String,
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
    #[serde(default)]
    pub summary: String,
}

impl LogEntry {
    /// Deterministic identity shared by the log and the index.
    pub fn id(&self) -> String {
        entry_id(&self.timestamp, &self.source)
    }
}

/// Build the `timestamp_source` identity used as the index row id.
pub fn entry_id(timestamp: &str, source: &str) -> String {
    format!("{}_{}", timestamp, source)
}

/// Metadata stored alongside every index row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMetadata {
    pub kind: EntryKind,
    pub timestamp: String,
    pub source: String,
}

/// A row destined for the vector index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub metadata: IndexMetadata,
}

impl IndexEntry {
    /// Project a log entry and its embedding into an index row.
    pub fn from_log(entry: &LogEntry, vector: Vec<f32>) -> Self {
        Self {
            id: entry.id(),
            vector,
            document: entry.summary.clone(),
            metadata: IndexMetadata {
                kind: entry.kind,
                timestamp: entry.timestamp.clone(),
                source: entry.source.clone(),
            },
        }
    }
}

/// A row as listed back from the index (no vector).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntry {
    pub id: String,
    pub document: String,
    pub metadata: IndexMetadata,
}

/// A ranked query result.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub id: String,
    pub document: String,
    pub metadata: IndexMetadata,
    pub score: f32,
}

/// Equality predicate over index metadata.
///
/// Empty fields match everything, so [`MetadataFilter::none`] is the
/// unfiltered query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub kind: Option<EntryKind>,
    pub source: Option<String>,
}

impl MetadataFilter {
    pub fn none() -> Self {
        Self::default()
    }

    /// Restrict retrieval to deletion events.
    pub fn deletions() -> Self {
        Self {
            kind: Some(EntryKind::Deletion),
            source: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.source.is_none()
    }

    pub fn matches(&self, metadata: &IndexMetadata) -> bool {
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &metadata.source != source {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_normalises_spelling_variants() {
        assert_eq!("deleted".parse::<EntryKind>().unwrap(), EntryKind::Deletion);
        assert_eq!("Deletion".parse::<EntryKind>().unwrap(), EntryKind::Deletion);
        assert_eq!("summary".parse::<EntryKind>().unwrap(), EntryKind::Summary);
        assert!("renamed".parse::<EntryKind>().is_err());
    }

    #[test]
    fn legacy_lines_deserialize() {
        let old: LogEntry = serde_json::from_str(
            r#"{"timestamp": "2024-05-01T10:00:00.000001", "source": "workspace/a.txt", "summary": "notes"}"#,
        )
        .unwrap();
        assert_eq!(old.kind, EntryKind::Summary);

        let deleted: LogEntry = serde_json::from_str(
            r#"{"timestamp": "t", "source": "workspace/b.txt", "type": "deleted", "summary": "File was deleted"}"#,
        )
        .unwrap();
        assert_eq!(deleted.kind, EntryKind::Deletion);
    }

    #[test]
    fn serialized_kind_is_canonical() {
        let entry = LogEntry {
            timestamp: "t".to_string(),
            source: "workspace/b.txt".to_string(),
            kind: EntryKind::Deletion,
            summary: "File was deleted".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""type":"deletion""#));
        assert_eq!(entry.id(), "t_workspace/b.txt");
    }

    #[test]
    fn filter_matches_on_all_set_fields() {
        let meta = IndexMetadata {
            kind: EntryKind::Deletion,
            timestamp: "t".to_string(),
            source: "workspace/f2".to_string(),
        };
        assert!(MetadataFilter::none().matches(&meta));
        assert!(MetadataFilter::deletions().matches(&meta));
        let other_source = MetadataFilter {
            kind: Some(EntryKind::Deletion),
            source: Some("workspace/f1".to_string()),
        };
        assert!(!other_source.matches(&meta));
        let summaries = MetadataFilter {
            kind: Some(EntryKind::Summary),
            source: None,
        };
        assert!(!summaries.matches(&meta));
    }
}
