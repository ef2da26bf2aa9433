//! Validated workspace-relative paths.
//!
//! Every key of the persisted path state is a [`WorkspacePath`]. The parser
//! rejects values that cannot be a file below the workspace: absolute paths,
//! drive specs, parent traversals, and strings that look like a shell
//! invocation rather than a path (a state file that once recorded
//! `python main.py watch` must not keep tracking it).

use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

/// Command words that never start a workspace path.
const COMMAND_WORDS: &[&str] = &[
    "python",
    "python3",
    "py",
    "cmd",
    "bash",
    "sh",
    "powershell",
    "pwsh",
    "node",
    "start",
];

const SHELL_SEQUENCES: &[&str] = &["&&", "||", "|", ";", "`", "$(", ">", "<"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' has no directory separator")]
    NoSeparator(String),
    #[error("path '{0}' is absolute")]
    Absolute(String),
    #[error("path '{0}' starts with a drive spec")]
    Drive(String),
    #[error("path '{0}' escapes the workspace")]
    ParentTraversal(String),
    #[error("path '{0}' looks like a shell command")]
    Command(String),
}

/// A forward-slash path relative to the workspace base, e.g. `workspace/a.txt`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkspacePath(String);

impl WorkspacePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }

        let mut normalized = trimmed.replace('\\', "/");
        while let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        }

        if has_drive_spec(&normalized) {
            return Err(PathError::Drive(raw.to_string()));
        }
        if normalized.starts_with('/') {
            return Err(PathError::Absolute(raw.to_string()));
        }
        if looks_like_command(&normalized) {
            return Err(PathError::Command(raw.to_string()));
        }
        if !normalized.contains('/') {
            return Err(PathError::NoSeparator(raw.to_string()));
        }
        if normalized.split('/').any(|part| part == "..") {
            return Err(PathError::ParentTraversal(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn has_drive_spec(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn looks_like_command(path: &str) -> bool {
    if SHELL_SEQUENCES.iter().any(|seq| path.contains(seq)) {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    match lower.split_once(char::is_whitespace) {
        Some((first, _)) => COMMAND_WORDS.contains(&first),
        None => false,
    }
}

impl fmt::Display for WorkspacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for WorkspacePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WorkspacePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for WorkspacePath {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}
