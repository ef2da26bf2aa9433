//! Text-completion service abstraction.
//!
//! [`Completer`] is the seam to the language model. [`OllamaCompleter`]
//! talks to Ollama's `/api/generate` endpoint in streaming mode: the body is
//! newline-delimited JSON, one fragment per line, and the final line carries
//! `"done": true`. Fragments are reassembled by [`StreamAssembler`], which
//! tolerates lines split across network chunks and skips lines that do not
//! parse.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Upper bound on the whole call. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Print fragments to stdout as they arrive.
    pub echo: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            timeout: None,
            echo: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

/// Submits a prompt and returns the concatenated completion text.
///
/// Connection failures and timeouts are returned as errors; callers decide
/// how to surface them.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Accumulates an NDJSON completion stream.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
    text: String,
    skipped: usize,
    done: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the fragments completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut fragments = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(fragment) = self.accept_line(&line) {
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.accept_line(&line)
    }

    fn accept_line(&mut self, line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => {
                if value.get("done").and_then(|d| d.as_bool()) == Some(true) {
                    self.done = true;
                }
                if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
                    warn!("completion stream reported an error: {}", err);
                    self.skipped += 1;
                    return None;
                }
                let fragment = value.get("response").and_then(|r| r.as_str())?;
                self.text.push_str(fragment);
                Some(fragment.to_string())
            }
            Err(e) => {
                warn!("skipping invalid completion fragment: {}", e);
                self.skipped += 1;
                None
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Streaming client for Ollama's `/api/generate`.
pub struct OllamaCompleter {
    client: reqwest::Client,
    url: String,
    model: String,
    max_tokens: u32,
}

impl OllamaCompleter {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: format!("{}/api/generate", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": true,
            "options": { "num_predict": self.max_tokens },
        });

        let mut response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Could not connect to Ollama at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status, body_text);
        }

        let mut assembler = StreamAssembler::new();
        while let Some(chunk) = response.chunk().await? {
            for fragment in assembler.push(&chunk) {
                if request.echo {
                    print!("{}", fragment);
                    let _ = std::io::stdout().flush();
                }
            }
            if assembler.is_done() {
                break;
            }
        }
        if let Some(fragment) = assembler.finish() {
            if request.echo {
                print!("{}", fragment);
            }
        }
        if request.echo {
            println!();
        }

        debug!(
            "completion finished: {} chars, {} fragments skipped",
            assembler.text().len(),
            assembler.skipped()
        );
        Ok(assembler.into_text())
    }
}

#[async_trait]
impl Completer for OllamaCompleter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream(request))
                .await
                .map_err(|_| anyhow::anyhow!("completion timed out after {}s", limit.as_secs()))?,
            None => self.stream(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_fragments_across_chunk_boundaries() {
        let mut asm = StreamAssembler::new();
        assert!(asm.push(br#"{"response":"Hel"#).is_empty());
        let frags = asm.push(b"lo\"}\n{\"response\":\" world\"}\n");
        assert_eq!(frags, vec!["Hello".to_string(), " world".to_string()]);
        asm.push(b"{\"response\":\"\",\"done\":true}\n");
        assert!(asm.is_done());
        assert_eq!(asm.into_text(), "Hello world");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut asm = StreamAssembler::new();
        asm.push(b"{\"response\":\"a\"}\nnot-json\n{\"response\":\"b\"}\n");
        assert_eq!(asm.skipped(), 1);
        assert_eq!(asm.text(), "ab");
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let mut asm = StreamAssembler::new();
        asm.push(b"{\"response\":\"tail\"}");
        assert_eq!(asm.finish().as_deref(), Some("tail"));
        assert_eq!(asm.text(), "tail");
    }

    #[test]
    fn error_lines_contribute_nothing() {
        let mut asm = StreamAssembler::new();
        asm.push(b"{\"error\":\"model not found\"}\n");
        assert_eq!(asm.skipped(), 1);
        assert!(asm.text().is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let config = LlmConfig {
            url: "http://127.0.0.1:9".to_string(),
            ..LlmConfig::default()
        };
        let completer = OllamaCompleter::new(&config).unwrap();
        let request = CompletionRequest::new("hi").with_timeout(Duration::from_secs(5));
        assert!(completer.complete(&request).await.is_err());
    }
}
