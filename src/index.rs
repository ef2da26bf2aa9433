//! Vector index abstraction.
//!
//! The index is a derived view of the event log: rows can be added
//! (add-or-overwrite by id), queried by cosine similarity with an optional
//! metadata predicate, listed, and deleted. Two seams are defined:
//!
//! - [`VectorIndex`]: an open handle on the index.
//! - [`IndexStorage`]: the persisted location a handle is opened on, which
//!   can also be destroyed wholesale for a rebuild.
//!
//! A handle must be [`closed`](VectorIndex::close) before its storage is
//! destroyed and reopened; two live handles on the same SQLite file during a
//! teardown corrupt it.
//!
//! | Backend | Types |
//! |---------|-------|
//! | SQLite (WAL, brute-force cosine in Rust) | [`SqliteStorage`], [`SqliteIndex`] |
//! | In-memory (`RwLock<BTreeMap>`) | [`InMemoryStorage`], [`InMemoryIndex`] |

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{EntryKind, IndexEntry, IndexHit, IndexMetadata, MetadataFilter, StoredEntry};

/// An open handle on the vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert rows, overwriting any existing row with the same id.
    async fn add(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Top-`k` rows by cosine similarity to `embedding` among rows matching
    /// `filter`. Ties are broken by id so results are deterministic.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<IndexHit>>;

    /// Every row, ordered by id.
    async fn get(&self) -> Result<Vec<StoredEntry>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Release the underlying storage handle. Idempotent.
    async fn close(&self);
}

/// Persisted location of an index.
#[async_trait]
pub trait IndexStorage: Send + Sync {
    async fn open(&self) -> Result<Box<dyn VectorIndex>>;

    /// Remove all persisted data. Every handle must be closed first.
    async fn destroy(&self) -> Result<()>;

    fn describe(&self) -> String;
}

fn rank_hits(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}

// ============ In-memory backend ============

#[derive(Debug, Clone)]
struct MemoryRow {
    vector: Vec<f32>,
    document: String,
    metadata: IndexMetadata,
}

type MemoryRows = Arc<RwLock<BTreeMap<String, MemoryRow>>>;

/// In-memory storage for tests. Handles opened from the same storage share
/// the rows, as handles on one SQLite file would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    rows: MemoryRows,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStorage for InMemoryStorage {
    async fn open(&self) -> Result<Box<dyn VectorIndex>> {
        Ok(Box::new(InMemoryIndex {
            rows: Arc::clone(&self.rows),
            closed: RwLock::new(false),
        }))
    }

    async fn destroy(&self) -> Result<()> {
        self.rows
            .write()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?
            .clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

pub struct InMemoryIndex {
    rows: MemoryRows,
    closed: RwLock<bool>,
}

impl InMemoryIndex {
    fn ensure_open(&self) -> Result<()> {
        let closed = *self
            .closed
            .read()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?;
        if closed {
            anyhow::bail!("index handle is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn add(&self, entries: &[IndexEntry]) -> Result<()> {
        self.ensure_open()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?;
        for entry in entries {
            rows.insert(
                entry.id.clone(),
                MemoryRow {
                    vector: entry.vector.clone(),
                    document: entry.document.clone(),
                    metadata: entry.metadata.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<IndexHit>> {
        self.ensure_open()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?;
        let hits = rows
            .iter()
            .filter(|(_, row)| filter.matches(&row.metadata))
            .map(|(id, row)| IndexHit {
                id: id.clone(),
                document: row.document.clone(),
                metadata: row.metadata.clone(),
                score: cosine_similarity(embedding, &row.vector),
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn get(&self) -> Result<Vec<StoredEntry>> {
        self.ensure_open()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?;
        Ok(rows
            .iter()
            .map(|(id, row)| StoredEntry {
                id: id.clone(),
                document: row.document.clone(),
                metadata: row.metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.ensure_open()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?;
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("index lock poisoned"))?
            .len())
    }

    async fn close(&self) {
        if let Ok(mut closed) = self.closed.write() {
            *closed = true;
        }
    }
}

// ============ SQLite backend ============

/// SQLite database file holding the index.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    path: PathBuf,
}

impl SqliteStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecars(&self) -> Vec<PathBuf> {
        let base = self.path.to_string_lossy().to_string();
        vec![
            self.path.clone(),
            PathBuf::from(format!("{}-wal", base)),
            PathBuf::from(format!("{}-shm", base)),
        ]
    }
}

#[async_trait]
impl IndexStorage for SqliteStorage {
    async fn open(&self) -> Result<Box<dyn VectorIndex>> {
        let pool = connect(&self.path).await?;
        migrate(&pool).await?;
        Ok(Box::new(SqliteIndex { pool }))
    }

    async fn destroy(&self) -> Result<()> {
        for file in self.sidecars() {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove index file: {}", file.display())
                    })
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open index database: {}", db_path.display()))?;

    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_index (
            id TEXT PRIMARY KEY,
            document TEXT NOT NULL,
            kind TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            source TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_index_kind ON memory_index(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_index_source ON memory_index(source)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Open handle on a [`SqliteStorage`].
pub struct SqliteIndex {
    pool: SqlitePool,
}

fn row_metadata(row: &sqlx::sqlite::SqliteRow) -> Result<IndexMetadata> {
    let kind: String = row.get("kind");
    Ok(IndexMetadata {
        kind: kind.parse::<EntryKind>()?,
        timestamp: row.get("timestamp"),
        source: row.get("source"),
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn add(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO memory_index (id, document, kind, timestamp, source, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document = excluded.document,
                    kind = excluded.kind,
                    timestamp = excluded.timestamp,
                    source = excluded.source,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.document)
            .bind(entry.metadata.kind.as_str())
            .bind(&entry.metadata.timestamp)
            .bind(&entry.metadata.source)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<IndexHit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document, kind, timestamp, source, embedding
            FROM memory_index
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR source = ?2)
            "#,
        )
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.source.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            hits.push(IndexHit {
                id: row.get("id"),
                document: row.get("document"),
                metadata: row_metadata(row)?,
                score: cosine_similarity(embedding, &blob_to_vec(&blob)),
            });
        }
        Ok(rank_hits(hits, k))
    }

    async fn get(&self) -> Result<Vec<StoredEntry>> {
        let rows = sqlx::query(
            "SELECT id, document, kind, timestamp, source FROM memory_index ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredEntry {
                    id: row.get("id"),
                    document: row.get("document"),
                    metadata: row_metadata(row)?,
                })
            })
            .collect()
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM memory_index WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
