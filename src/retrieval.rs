//! Question answering over the memory index.
//!
//! A question is embedded, the top-K nearest index rows (optionally
//! restricted by a [`MetadataFilter`]) become a ranked context block, and the
//! completion service is asked to answer strictly from that context.
//!
//! `answer` always returns a user-facing string: service failures become
//! descriptive messages instead of errors, and an empty candidate set
//! short-circuits before the completion service is contacted.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::completion::{Completer, CompletionRequest};
use crate::embedding::{embed_one, Embedder};
use crate::index::VectorIndex;
use crate::models::{IndexHit, MetadataFilter};

pub const NO_RELEVANT_ENTRIES: &str = "No relevant memory entries found.";
pub const NO_ANSWER: &str = "No answer generated.";

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub answer_timeout: Duration,
    /// Stream the answer to stdout while it is generated.
    pub echo: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            answer_timeout: Duration::from_secs(30),
            echo: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Generated,
    NoEntries,
    NoAnswer,
    EmbeddingUnavailable,
    CompletionUnavailable,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub kind: AnswerKind,
    pub text: String,
    pub context: Vec<IndexHit>,
}

impl Answer {
    fn new(kind: AnswerKind, text: String, context: Vec<IndexHit>) -> Self {
        Self {
            kind,
            text,
            context,
        }
    }
}

pub struct Retriever<'a> {
    index: &'a dyn VectorIndex,
    embedder: &'a dyn Embedder,
    completer: &'a dyn Completer,
    options: RetrievalOptions,
}

impl<'a> Retriever<'a> {
    pub fn new(
        index: &'a dyn VectorIndex,
        embedder: &'a dyn Embedder,
        completer: &'a dyn Completer,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            completer,
            options,
        }
    }

    /// Top-K rows for `question`, in index ranking order.
    pub async fn retrieve(&self, question: &str, filter: &MetadataFilter) -> Result<Vec<IndexHit>> {
        let vector = embed_one(self.embedder, question).await?;
        self.index.query(&vector, self.options.top_k, filter).await
    }

    pub async fn answer(&self, question: &str, filter: &MetadataFilter) -> String {
        self.answer_detailed(question, filter).await.text
    }

    /// Like [`answer`](Self::answer), but also reports how the text came about
    /// and which entries were used as context.
    pub async fn answer_detailed(&self, question: &str, filter: &MetadataFilter) -> Answer {
        let started = Instant::now();
        let hits = match self.retrieve(question, filter).await {
            Ok(hits) => hits,
            Err(e) => return embedding_unavailable(&e),
        };
        debug!("search took {:.2}s", started.elapsed().as_secs_f64());
        self.answer_from_hits(question, hits).await
    }

    /// Answer from already retrieved `hits`, e.g. after showing them to the
    /// user. Zero hits short-circuit without calling the completer.
    pub async fn answer_from_hits(&self, question: &str, hits: Vec<IndexHit>) -> Answer {
        let started = Instant::now();
        if hits.is_empty() {
            return Answer::new(AnswerKind::NoEntries, NO_RELEVANT_ENTRIES.to_string(), hits);
        }
        for (i, hit) in hits.iter().enumerate() {
            debug!(
                "context {}: [{}] ({}) score={:.3}",
                i + 1,
                hit.metadata.timestamp,
                hit.metadata.source,
                hit.score
            );
        }

        let request = CompletionRequest::new(build_prompt(question, &hits))
            .with_timeout(self.options.answer_timeout)
            .with_echo(self.options.echo);
        let text = match self.completer.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                return Answer::new(
                    AnswerKind::CompletionUnavailable,
                    format!("Could not reach the completion service: {}", e),
                    hits,
                )
            }
        };

        info!(
            "answered with {} entries in {:.2}s",
            hits.len(),
            started.elapsed().as_secs_f64()
        );

        let trimmed = text.trim();
        if trimmed.is_empty() {
            Answer::new(AnswerKind::NoAnswer, NO_ANSWER.to_string(), hits)
        } else {
            Answer::new(AnswerKind::Generated, trimmed.to_string(), hits)
        }
    }
}

/// Answer reported when the question could not be embedded.
pub fn embedding_unavailable(error: &anyhow::Error) -> Answer {
    Answer::new(
        AnswerKind::EmbeddingUnavailable,
        format!("Embedding service unavailable: {}", error),
        Vec::new(),
    )
}

/// Render hits as `[timestamp] (source)\nsummary` blocks separated by a blank line.
pub fn format_context(hits: &[IndexHit]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "[{}] ({})\n{}",
                hit.metadata.timestamp, hit.metadata.source, hit.document
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_prompt(question: &str, hits: &[IndexHit]) -> String {
    format!(
        "You are answering questions about a workspace using its memory log.\n\
         Answer strictly from the memory log entries below. Consider every entry given, \
         do not invent facts that are not in them, and if the answer is not present say so.\n\n\
         Memory log entries:\n\n{}\n\nQuestion: {}\n",
        format_context(hits),
        question
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::index::{IndexStorage, InMemoryStorage};
    use crate::models::{EntryKind, IndexMetadata};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Completer for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(" deleted yesterday \n".to_string())
        }
    }

    fn hit(source: &str, summary: &str) -> IndexHit {
        IndexHit {
            id: format!("t_{}", source),
            document: summary.to_string(),
            metadata: IndexMetadata {
                kind: EntryKind::Summary,
                timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
                source: source.to_string(),
            },
            score: 1.0,
        }
    }

    #[test]
    fn context_keeps_rank_order() {
        let ctx = format_context(&[hit("workspace/b", "second"), hit("workspace/a", "first")]);
        assert_eq!(
            ctx,
            "[2024-01-01T00:00:00.000000Z] (workspace/b)\nsecond\n\n\
             [2024-01-01T00:00:00.000000Z] (workspace/a)\nfirst"
        );
    }

    #[test]
    fn prompt_contains_question_and_context() {
        let prompt = build_prompt("what changed?", &[hit("workspace/a", "edited intro")]);
        assert!(prompt.contains("Question: what changed?"));
        assert!(prompt.contains("(workspace/a)\nedited intro"));
        assert!(prompt.contains("strictly"));
    }

    #[tokio::test]
    async fn answers_from_hits_already_shown() {
        let index = InMemoryStorage::new().open().await.unwrap();
        let embedder = DisabledProvider;
        let completer = Recorder::default();
        let retriever = Retriever::new(
            index.as_ref(),
            &embedder,
            &completer,
            RetrievalOptions::default(),
        );

        let answer = retriever
            .answer_from_hits("what was removed?", vec![hit("workspace/f2", "File was deleted")])
            .await;
        assert_eq!(answer.kind, AnswerKind::Generated);
        assert_eq!(answer.text, "deleted yesterday");
        assert_eq!(answer.context.len(), 1);
        assert!(completer.prompts.lock().unwrap()[0].contains("(workspace/f2)\nFile was deleted"));

        let empty = retriever.answer_from_hits("anything?", Vec::new()).await;
        assert_eq!(empty.kind, AnswerKind::NoEntries);
        assert_eq!(completer.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unembeddable_question_reports_unavailable() {
        let index = InMemoryStorage::new().open().await.unwrap();
        let embedder = DisabledProvider;
        let completer = Recorder::default();
        let retriever = Retriever::new(
            index.as_ref(),
            &embedder,
            &completer,
            RetrievalOptions::default(),
        );
        let answer = retriever.answer_detailed("q", &MetadataFilter::none()).await;
        assert_eq!(answer.kind, AnswerKind::EmbeddingUnavailable);
        assert!(answer.text.starts_with("Embedding service unavailable:"));
        assert!(completer.prompts.lock().unwrap().is_empty());
    }
}
