//! Persistent vector index backed by SQLite.
//!
//! Each entry stores one chunk with its embedding as a little-endian f32 blob.
//! Search is a brute-force cosine scan, which is plenty for the handful of
//! documents a chat uploads.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index file error at '{}': {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("index database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Where a chat's index lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    /// One knowledge base for every chat.
    #[default]
    Shared,
    /// A separate index per chat.
    PerChat,
}

impl IndexScope {
    pub fn index_path(self, root: &Path, chat_id: i64) -> PathBuf {
        match self {
            Self::Shared => root.join("index.db"),
            Self::PerChat => root.join(format!("chat_{chat_id}")).join("index.db"),
        }
    }
}

/// One stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    pub text: String,
    pub source: String,
    /// Content hash of the document the chunk came from.
    pub digest: String,
    pub page: Option<u32>,
    pub chunk_index: usize,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub text: String,
    pub source: String,
    pub score: f32,
}

#[derive(Debug)]
pub struct VectorIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl VectorIndex {
    /// Open (or create) the index file at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        index.init_schema()?;
        info!("Opened vector index at {:?} ({} entries)", path, index.len()?);
        Ok(index)
    }

    pub fn in_memory() -> Result<Self, IndexError> {
        let index = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        index.init_schema()?;
        Ok(index)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), IndexError> {
        // page 0 means "not paged" so the unique key never holds a NULL.
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                digest TEXT NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                UNIQUE (source, digest, page, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_source ON entries(source);
            "#,
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    /// Whether the chunk at `chunk_index` of the document with this source,
    /// digest and page is already stored.
    pub fn contains(
        &self,
        source: &str,
        digest: &str,
        page: Option<u32>,
        chunk_index: usize,
    ) -> Result<bool, IndexError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT id FROM entries
                 WHERE source = ?1 AND digest = ?2 AND page = ?3 AND chunk_index = ?4",
                params![source, digest, page.unwrap_or(0), chunk_index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert entries in one transaction and return how many were new.
    ///
    /// Stored entries are never rewritten. An entry whose key is already
    /// present (another chat indexed the same document first) is skipped.
    pub fn add(&self, entries: &[IndexEntry]) -> Result<usize, IndexError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO entries (source, digest, page, chunk_index, text, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                inserted += stmt.execute(params![
                    entry.source,
                    entry.digest,
                    entry.page.unwrap_or(0),
                    entry.chunk_index as i64,
                    entry.text,
                    encode_vector(&entry.vector),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Indexed {} of {} entries", inserted, entries.len());
        Ok(inserted)
    }

    /// Top `k` entries by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT source, text, embedding FROM entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut scored = Vec::new();
        let mut mismatched = 0usize;
        for row in rows {
            let (source, text, blob) = row?;
            let vector = decode_vector(&blob);
            if vector.len() != query.len() {
                mismatched += 1;
                continue;
            }
            scored.push(ScoredChunk {
                score: cosine_similarity(query, &vector),
                text,
                source,
            });
        }
        if mismatched > 0 {
            warn!("Skipped {} entries with mismatched embedding dimensions", mismatched);
        }

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
