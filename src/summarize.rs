//! File summarization through the completion service.
//!
//! Summaries feed the event log, so every failure here is a data problem for
//! a single file: it is logged and the file is skipped. No timeout is applied;
//! a large backlog during full sync is summarized sequentially.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::{Completer, CompletionRequest};

pub struct Summarizer {
    completer: Arc<dyn Completer>,
    max_input_chars: usize,
}

impl Summarizer {
    pub fn new(completer: Arc<dyn Completer>, max_input_chars: usize) -> Self {
        Self {
            completer,
            max_input_chars,
        }
    }

    /// Summarize one file. `None` means nothing should be logged for it.
    pub async fn summarize(&self, path: &Path) -> Option<String> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                return None;
            }
        };
        if content.trim().is_empty() {
            warn!("skipping empty file: {}", path.display());
            return None;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let prompt = format!(
            "Summarize this file ({}):\n\n{}",
            name,
            truncate_chars(&content, self.max_input_chars)
        );

        debug!("summarizing {}", path.display());
        let summary = match self.completer.complete(&CompletionRequest::new(prompt)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("summarization failed for {}: {:#}", path.display(), e);
                return None;
            }
        };

        let summary = summary.trim();
        if summary.is_empty() {
            warn!("completion service returned an empty summary for {}", path.display());
            return None;
        }
        Some(summary.to_string())
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
