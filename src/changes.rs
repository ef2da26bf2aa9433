//! Change detection against the persisted path state.
//!
//! Walks the workspace tree and classifies every file as modified (new or
//! newer than its record), unchanged, or deleted (recorded but no longer on
//! disk). Keys take the form `<root dir name>/<path below root>` with forward
//! slashes, the same form the path state persists.
//!
//! Files that disappear between the directory listing and the metadata read
//! are skipped silently; that race with live deletions is expected.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::WorkspaceConfig;
use crate::path_state::{round_mtime, PathState};
use crate::workspace_path::WorkspacePath;

/// Which files under the root take part in change detection.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    ignored_extensions: Vec<String>,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl ScanFilter {
    pub fn new(
        ignored_extensions: Vec<String>,
        exclude_globs: &[String],
        follow_symlinks: bool,
    ) -> Result<Self> {
        let mut patterns = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        patterns.extend(exclude_globs.iter().cloned());
        Ok(Self {
            ignored_extensions,
            exclude: build_globset(&patterns)?,
            follow_symlinks,
        })
    }

    pub fn from_config(config: &WorkspaceConfig) -> Result<Self> {
        Self::new(
            config.ignored_extensions.clone(),
            &config.exclude_globs,
            config.follow_symlinks,
        )
    }

    pub fn follows_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// True when a file name ends with one of the ignored extensions.
    pub fn is_ignored_name(&self, file_name: &str) -> bool {
        self.ignored_extensions
            .iter()
            .any(|ext| file_name.ends_with(ext.as_str()))
    }

    /// True when the file at `relative` (below the root) is skipped.
    pub fn excludes(&self, relative: &Path) -> bool {
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.is_ignored_name(&name) {
            return true;
        }
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        self.exclude.is_match(&rel_str)
    }
}

/// A file that needs summarizing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFile {
    /// Key as logged, e.g. `workspace/notes/a.md`.
    pub source: String,
    pub absolute: PathBuf,
    /// Rounded modification time in seconds.
    pub modified_at: f64,
    /// `None` when the key is not a valid workspace path; such files are
    /// summarized but never recorded in the path state.
    pub path: Option<WorkspacePath>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub modified: Vec<ChangedFile>,
    pub deleted: Vec<WorkspacePath>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Name used as the first key component for files under `root`.
pub fn root_label(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .or_else(|| {
            root.canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        })
        .unwrap_or_else(|| "workspace".to_string())
}

/// Key for `path`, which must lie under `root`.
pub fn source_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rel_str = relative.to_string_lossy().replace('\\', "/");
    if rel_str.is_empty() {
        return None;
    }
    Some(format!("{}/{}", root_label(root), rel_str))
}

/// Rounded modification time of a file, or `None` if it cannot be read.
pub fn file_mtime(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()?
        .as_secs_f64();
    Some(round_mtime(secs))
}

pub fn compute_changes(root: &Path, filter: &ScanFilter, prior: &PathState) -> Result<ChangeSet> {
    if !root.is_dir() {
        bail!("Workspace root does not exist: {}", root.display());
    }

    let mut changes = ChangeSet::default();
    let mut on_disk: HashSet<String> = HashSet::new();

    let walker = WalkDir::new(root).follow_links(filter.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if filter.excludes(relative) {
            continue;
        }
        let source = match source_key(root, path) {
            Some(s) => s,
            None => continue,
        };

        // Vanished since the listing.
        let Some(current) = file_mtime(path) else {
            debug!("file disappeared during scan: {}", path.display());
            continue;
        };
        on_disk.insert(source.clone());

        let stale = match prior.get(&source) {
            Some(stored) => current > round_mtime(stored),
            None => true,
        };
        if !stale {
            changes.unchanged += 1;
            continue;
        }

        let workspace_path = match WorkspacePath::parse(&source) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("{}; it will be summarized but not tracked", e);
                None
            }
        };
        changes.modified.push(ChangedFile {
            source,
            absolute: path.to_path_buf(),
            modified_at: current,
            path: workspace_path,
        });
    }

    changes.deleted = prior
        .paths()
        .filter(|p| !on_disk.contains(p.as_str()))
        .cloned()
        .collect();

    changes.modified.sort_by(|a, b| a.source.cmp(&b.source));
    // PathState iterates in key order, so `deleted` is already sorted.

    Ok(changes)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
