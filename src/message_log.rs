//! Persistent SQLite log of chat messages.
//!
//! Saves run on the blocking pool; each one is a single committed statement.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info};

/// Fixed-width so text order matches time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to create database directory '{}': {source}", path.display())]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("message store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
    #[error("message store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One logged message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MessageLog {
    conn: Arc<Mutex<Connection>>,
}

impl MessageLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| LogError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let log = Self::from_connection(Connection::open(path)?)?;
        info!("Opened message log at {:?}", path);
        Ok(log)
    }

    pub fn in_memory() -> Result<Self, LogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LogError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LogError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await?
    }

    /// Save one message. Without a timestamp the current time is used.
    ///
    /// Constraint violations (duplicate id, NULL fields) come straight back
    /// from SQLite.
    pub async fn save(
        &self,
        id: i64,
        username: Option<String>,
        message: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), LogError> {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, username, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![id, username, message, format_timestamp(&timestamp)],
            )?;
            debug!("Logged message {}", id);
            Ok(())
        })
        .await
    }

    /// Save a message under a fresh id assigned by SQLite. Returns the id.
    ///
    /// Telegram message ids are only unique within a chat, so the bot logs
    /// through this rather than `save`.
    pub async fn append(&self, username: String, message: String) -> Result<i64, LogError> {
        let timestamp = format_timestamp(&Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (username, message, timestamp) VALUES (?1, ?2, ?3)",
                params![username, message, timestamp],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Most recent messages first, at most `limit`.
    pub async fn recent(&self, limit: usize) -> Result<Vec<MessageRecord>, LogError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, message, timestamp FROM messages
                 ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, username, message, ts) = row?;
                records.push(MessageRecord {
                    id,
                    username,
                    message,
                    timestamp: parse_timestamp(&ts)?,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, LogError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses our own format and SQLite's `CURRENT_TIMESTAMP` default.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, LogError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| LogError::Timestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[tokio::test]
    async fn test_save_then_recent() {
        let log = MessageLog::in_memory().unwrap();
        log.save(1, s("John"), s("Hello, world!"), Some(at(10, 0))).await.unwrap();

        let records = log.recent(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].username, "John");
        assert_eq!(records[0].message, "Hello, world!");
        assert_eq!(records[0].timestamp, at(10, 0));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let log = MessageLog::in_memory().unwrap();
        log.save(1, s("a"), s("older"), Some(at(9, 0))).await.unwrap();
        log.save(2, s("b"), s("newest"), Some(at(11, 0))).await.unwrap();
        log.save(3, s("c"), s("middle"), Some(at(10, 0))).await.unwrap();

        let records = log.recent(10).await.unwrap();
        let texts: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(texts, vec!["newest", "middle", "older"]);

        assert_eq!(log.recent(1).await.unwrap()[0].id, 2);
    }

    #[tokio::test]
    async fn test_default_timestamp_is_now() {
        let log = MessageLog::in_memory().unwrap();
        let before = Utc::now();
        log.save(1, s("a"), s("now"), None).await.unwrap();
        let after = Utc::now();

        let ts = log.recent(1).await.unwrap()[0].timestamp;
        assert!(ts >= before && ts <= after);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected_by_store() {
        let log = MessageLog::in_memory().unwrap();
        let err = log.save(1, None, s("text"), None).await.unwrap_err();
        assert!(matches!(err, LogError::Sqlite(_)));
        let err = log.save(2, s("user"), None, None).await.unwrap_err();
        assert!(matches!(err, LogError::Sqlite(_)));
        assert_eq!(log.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let log = MessageLog::in_memory().unwrap();
        log.save(7, s("a"), s("first"), None).await.unwrap();
        assert!(log.save(7, s("a"), s("second"), None).await.is_err());
        assert_eq!(log.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_assigns_ids() {
        let log = MessageLog::in_memory().unwrap();
        log.save(10, s("a"), s("explicit"), Some(at(9, 0))).await.unwrap();
        let first = log.append("bot".into(), "one".into()).await.unwrap();
        let second = log.append("bot".into(), "two".into()).await.unwrap();
        assert!(first > 10);
        assert_eq!(second, first + 1);

        let records = log.recent(1).await.unwrap();
        assert_eq!(records[0].message, "two");
    }

    #[test]
    fn test_parses_sqlite_default_timestamp() {
        let ts = parse_timestamp("2024-01-15 10:00:00").unwrap();
        assert_eq!(ts, at(10, 0));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_persists_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("messages.db");
        {
            let log = MessageLog::open(&path).unwrap();
            log.save(1, s("a"), s("kept"), None).await.unwrap();
        }
        let log = MessageLog::open(&path).unwrap();
        assert_eq!(log.count().await.unwrap(), 1);
    }
}
