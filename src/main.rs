//! # Workspace Memory CLI (`wsm`)
//!
//! The `wsm` binary keeps a memory of workspace changes and answers
//! questions about it.
//!
//! ## Usage
//!
//! ```bash
//! wsm --config ./config/wsm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wsm sync` | Scan the workspace once, log changes, update the index |
//! | `wsm watch` | Scan, then follow live changes until Ctrl-C |
//! | `wsm ask "<question>"` | Answer a question from the memory index |
//! | `wsm digest` | Write recent log entries to `digest.txt` |
//! | `wsm index list\|prune\|resync` | Inspect or repair the index |
//! | `wsm log append` | Record a manual log entry |
//! | `wsm status` | Show counts for state, log and index |

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use workspace_memory::completion::OllamaCompleter;
use workspace_memory::config::{self, Config};
use workspace_memory::digest::generate_digest;
use workspace_memory::embedding::create_provider;
use workspace_memory::event_log::{EventLog, ReplayLine};
use workspace_memory::index::SqliteStorage;
use workspace_memory::index_sync::IndexSynchronizer;
use workspace_memory::logging;
use workspace_memory::models::{EntryKind, MetadataFilter};
use workspace_memory::path_state::PathStore;
use workspace_memory::progress::ProgressMode;
use workspace_memory::reconcile::{Reconciler, ReconcilerSettings};
use workspace_memory::retrieval::{embedding_unavailable, AnswerKind, RetrievalOptions, Retriever};
use workspace_memory::summarize::Summarizer;

const DEFAULT_CONFIG_PATH: &str = "./config/wsm.toml";

/// Workspace Memory: an append-only log of workspace changes, projected into
/// a vector index for question answering.
#[derive(Parser)]
#[command(
    name = "wsm",
    about = "Workspace Memory: a queryable log of what happened in your workspace",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/wsm.toml`; built-in defaults are used when that
    /// file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Sync progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the workspace once.
    ///
    /// Logs a summary for every new or modified file and a deletion for every
    /// tracked file that disappeared, upserts each new entry into the index,
    /// then prunes orphaned index rows.
    Sync,

    /// Scan the workspace, then follow live changes until interrupted.
    Watch,

    /// Answer a question from the memory index.
    Ask {
        question: String,

        /// Only use entries of this type (`summary` or `deletion`).
        #[arg(long)]
        kind: Option<String>,

        /// Only use entries about this source path.
        #[arg(long)]
        source: Option<String>,

        /// Number of entries to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the answer while it is generated.
        #[arg(long)]
        stream: bool,

        /// Print the retrieved entries before the answer.
        #[arg(long)]
        show_context: bool,
    },

    /// Write recent log entries to `<digest.output_dir>/digest.txt`.
    Digest {
        /// Include entries from the last N days.
        #[arg(long)]
        days: Option<i64>,
    },

    /// Inspect or repair the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Work with the event log directly.
    Log {
        #[command(subcommand)]
        action: LogAction,
    },

    /// Show counts for the path state, event log and index.
    Status,
}

#[derive(Subcommand)]
enum IndexAction {
    /// List every index row.
    List,
    /// Delete index rows with no matching log entry.
    Prune,
    /// Destroy the index and rebuild it from the log.
    Resync,
}

#[derive(Subcommand)]
enum LogAction {
    /// Append a manual entry and index it.
    Append {
        summary: String,

        #[arg(long)]
        source: String,

        #[arg(long, default_value = "summary")]
        kind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::load_config_or_default(Path::new(DEFAULT_CONFIG_PATH))?,
    };
    let progress = match cli.progress {
        Some(ProgressArg::Off) => ProgressMode::Off,
        Some(ProgressArg::Human) => ProgressMode::Human,
        Some(ProgressArg::Json) => ProgressMode::Json,
        None => ProgressMode::default_for_tty(),
    };

    match cli.command {
        Commands::Sync => {
            let mut reconciler = build_reconciler(&cfg, progress).await?;
            let report = reconciler.full_sync().await?;
            reconciler.maintenance().await;
            reconciler.shutdown().await;
            println!(
                "Sync complete: {} summarized, {} deleted, {} unchanged, {} skipped",
                report.summarized, report.deleted, report.unchanged, report.skipped
            );
            if report.index_failures > 0 {
                println!(
                    "{} entries could not be indexed; run `wsm index resync` once the embedding service is available.",
                    report.index_failures
                );
            }
        }
        Commands::Watch => {
            let mut reconciler = build_reconciler(&cfg, progress).await?;
            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing current event");
                    signal_token.cancel();
                }
            });
            reconciler.run(cancel).await?;
            reconciler.shutdown().await;
        }
        Commands::Ask {
            question,
            kind,
            source,
            top_k,
            stream,
            show_context,
        } => {
            let mut filter = cfg.retrieval.default_filter()?;
            if let Some(kind) = kind {
                filter.kind = Some(kind.parse::<EntryKind>()?);
            }
            if source.is_some() {
                filter.source = source;
            }
            let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
            if top_k < 1 {
                anyhow::bail!("--top-k must be >= 1");
            }
            run_ask(&cfg, &question, &filter, top_k, stream, show_context).await?;
        }
        Commands::Digest { days } => {
            let days = days.unwrap_or(cfg.digest.days);
            if days < 1 {
                anyhow::bail!("--days must be >= 1");
            }
            let log = EventLog::new(cfg.memory.log_path());
            let output = cfg.digest.output_dir.join("digest.txt");
            let report = generate_digest(&log, days, &output, Utc::now())?;
            match report.output {
                Some(path) => println!(
                    "Digest written to {} ({} entries)",
                    path.display(),
                    report.entries
                ),
                None => println!("No memory entries in the last {} day(s).", days),
            }
        }
        Commands::Index { action } => {
            let log = EventLog::new(cfg.memory.log_path());
            let mut sync = open_synchronizer(&cfg).await?;
            match action {
                IndexAction::List => {
                    let rows = sync.list().await?;
                    if rows.is_empty() {
                        println!("No memory entries found in the index.");
                    }
                    for (i, row) in rows.iter().enumerate() {
                        println!(
                            "#{} [{}] ({}) {}\n{}\n",
                            i + 1,
                            row.metadata.timestamp,
                            row.metadata.source,
                            row.metadata.kind,
                            row.document
                        );
                    }
                }
                IndexAction::Prune => {
                    let report = sync.prune_orphans(&log).await?;
                    println!(
                        "Examined {} rows, removed {} orphans.",
                        report.examined,
                        report.removed.len()
                    );
                    for id in &report.removed {
                        println!("  removed {}", id);
                    }
                }
                IndexAction::Resync => {
                    let report = sync.full_resync(&log).await?;
                    println!(
                        "Resync complete: {} log entries replayed, {} indexed, {} skipped, {} failed, {} malformed lines.",
                        report.replayed, report.indexed, report.skipped, report.failed, report.malformed
                    );
                }
            }
            sync.close().await;
        }
        Commands::Log {
            action:
                LogAction::Append {
                    summary,
                    source,
                    kind,
                },
        } => {
            let kind = kind.parse::<EntryKind>()?;
            let log = EventLog::new(cfg.memory.log_path());
            let entry = log.append(&summary, &source, kind)?;
            println!("Appended {}", entry.id());
            let sync = open_synchronizer(&cfg).await?;
            let outcome = sync.upsert(&entry).await;
            println!("Index: {:?}", outcome);
            sync.close().await;
        }
        Commands::Status => {
            let state = PathStore::new(cfg.memory.state_path()).load()?;
            let log = EventLog::new(cfg.memory.log_path());
            let (mut entries, mut malformed) = (0usize, 0usize);
            for line in log.replay()? {
                match line {
                    ReplayLine::Entry(_) => entries += 1,
                    ReplayLine::Malformed { .. } => malformed += 1,
                }
            }
            let sync = open_synchronizer(&cfg).await?;
            let rows = sync.index().count().await?;
            sync.close().await;

            println!("Workspace:     {}", cfg.workspace.root.display());
            println!("Tracked files: {}", state.len());
            println!("Log entries:   {} ({} malformed lines)", entries, malformed);
            println!("Index rows:    {}", rows);
            println!("Embedding:     {}", cfg.embedding.provider);
        }
    }

    Ok(())
}

async fn open_synchronizer(cfg: &Config) -> Result<IndexSynchronizer> {
    let storage = Arc::new(SqliteStorage::new(&cfg.index.path));
    let embedder = create_provider(&cfg.embedding)?;
    IndexSynchronizer::new(storage, embedder).await
}

async fn build_reconciler(cfg: &Config, progress: ProgressMode) -> Result<Reconciler> {
    std::fs::create_dir_all(&cfg.workspace.root)?;
    let sync = open_synchronizer(cfg).await?;
    let completer = Arc::new(OllamaCompleter::new(&cfg.llm)?);
    let summarizer = Summarizer::new(completer, cfg.llm.max_input_chars);
    let reconciler = Reconciler::new(
        ReconcilerSettings::from_config(cfg)?,
        PathStore::new(cfg.memory.state_path()),
        EventLog::new(cfg.memory.log_path()),
        sync,
        summarizer,
    )
    .with_progress(progress.reporter());
    Ok(reconciler)
}

async fn run_ask(
    cfg: &Config,
    question: &str,
    filter: &MetadataFilter,
    top_k: usize,
    stream: bool,
    show_context: bool,
) -> Result<()> {
    let sync = open_synchronizer(cfg).await?;
    let completer = OllamaCompleter::new(&cfg.llm)?;
    let options = RetrievalOptions {
        top_k,
        answer_timeout: cfg.llm.answer_timeout(),
        echo: stream,
    };

    let retriever = Retriever::new(sync.index(), sync.embedder(), &completer, options);
    let answer = if show_context {
        // Context goes out before the completion starts streaming.
        match retriever.retrieve(question, filter).await {
            Ok(hits) => {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{}] ({})\n   {}",
                        i + 1,
                        hit.metadata.timestamp,
                        hit.metadata.source,
                        hit.document
                    );
                }
                if !hits.is_empty() {
                    println!();
                }
                retriever.answer_from_hits(question, hits).await
            }
            Err(e) => embedding_unavailable(&e),
        }
    } else {
        retriever.answer_detailed(question, filter).await
    };

    // A streamed answer is already on stdout.
    if !(stream && answer.kind == AnswerKind::Generated) {
        println!("{}", answer.text);
    }

    sync.close().await;
    Ok(())
}
