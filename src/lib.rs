//! # Workspace Memory
//!
//! A local-first memory of what happened in a workspace directory.
//!
//! File creations, edits and deletions are summarized and appended to an
//! append-only event log, the single source of truth. The log is projected
//! into a vector index that answers natural-language questions about the
//! workspace's history. The index is derived data: it can be pruned of
//! orphans or rebuilt from the log at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │ Filesystem │──▶│  Changes / │──▶│ Event Log │──▶│ Index Sync   │
//! │  (watch)   │   │ Summarize  │   │ log.jsonl │   │ SQLite + vec │
//! └────────────┘   └────────────┘   └───────────┘   └──────┬───────┘
//!                                                          │
//!                                                          ▼
//!                                                   ┌──────────────┐
//!                                                   │  Retrieval   │
//!                                                   │  (wsm ask)   │
//!                                                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wsm sync                          # scan once, log changes, update index
//! wsm watch                         # scan, then follow live changes
//! wsm ask "what was deleted?" --kind deletion
//! wsm digest --days 7
//! wsm index resync                  # rebuild the index from the log
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Log entries, index rows, filters |
//! | [`workspace_path`] | Validated workspace-relative paths |
//! | [`path_state`] | Persisted last-synced mtimes |
//! | [`changes`] | Change detection against the path state |
//! | [`event_log`] | Append-only NDJSON event log |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`completion`] | Completion service abstraction |
//! | [`index`] | Vector index backends |
//! | [`index_sync`] | Upsert, orphan pruning, full resync |
//! | [`retrieval`] | Question answering |
//! | [`summarize`] | File summarization |
//! | [`watcher`] | Filesystem notifications |
//! | [`reconcile`] | The reconciliation loop |
//! | [`digest`] | Recent-activity digest |
//! | [`progress`] | Sync progress reporting |
//! | [`logging`] | Tracing setup |

pub mod changes;
pub mod completion;
pub mod config;
pub mod digest;
pub mod embedding;
pub mod event_log;
pub mod index;
pub mod index_sync;
pub mod logging;
pub mod models;
pub mod path_state;
pub mod progress;
pub mod reconcile;
pub mod retrieval;
pub mod summarize;
pub mod watcher;
pub mod workspace_path;
