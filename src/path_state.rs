//! Persisted path state: the last synced modification time of every tracked
//! workspace file.
//!
//! Stored as one pretty-printed JSON object (`last_seen.json`) mapping
//! workspace-relative path to mtime in float seconds. Keys that fail
//! [`WorkspacePath`] validation are dropped on load.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::workspace_path::WorkspacePath;

/// Digits kept when comparing modification times.
pub const MTIME_PRECISION: i32 = 6;

/// Round an mtime to [`MTIME_PRECISION`] decimal digits to absorb filesystem jitter.
pub fn round_mtime(secs: f64) -> f64 {
    let factor = 10f64.powi(MTIME_PRECISION);
    (secs * factor).round() / factor
}

/// In-memory view of the path state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathState {
    records: BTreeMap<WorkspacePath, f64>,
}

impl PathState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.records.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Record the last synced mtime for a path.
    pub fn record(&mut self, path: WorkspacePath, mtime: f64) {
        self.records.insert(path, mtime);
    }

    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.records.remove(key)
    }

    pub fn paths(&self) -> impl Iterator<Item = &WorkspacePath> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Build a state from raw keys, dropping invalid ones with a warning.
    pub fn from_raw(raw: BTreeMap<String, f64>) -> Self {
        let mut state = Self::new();
        for (key, mtime) in raw {
            match WorkspacePath::parse(&key) {
                Ok(path) => state.record(path, mtime),
                Err(e) => warn!("dropping invalid path state entry: {}", e),
            }
        }
        state
    }

    fn to_raw(&self) -> BTreeMap<&str, f64> {
        self.records
            .iter()
            .map(|(path, mtime)| (path.as_str(), *mtime))
            .collect()
    }
}

/// File-backed store for [`PathState`].
#[derive(Debug, Clone)]
pub struct PathStore {
    path: PathBuf,
}

impl PathStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file is an empty state.
    pub fn load(&self) -> Result<PathState> {
        if !self.path.exists() {
            return Ok(PathState::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read path state: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(PathState::new());
        }
        let raw: BTreeMap<String, f64> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse path state: {}", self.path.display()))?;
        Ok(PathState::from_raw(raw))
    }

    /// Persist the state via a temp file and rename so readers never see a
    /// half-written map.
    pub fn save(&self, state: &PathState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&state.to_raw())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write path state: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace path state: {}", self.path.display()))?;
        Ok(())
    }
}
