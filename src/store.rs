//! Job/Session Store
//!
//! Reads are served from an in-memory cache first and fall back to the
//! durable store; a durable hit repopulates the cache. Writes land in the
//! cache immediately and are mirrored to the durable store with retry. A
//! durable failure is logged and never fails the in-memory operation.

use crate::session::{Session, SessionRecord, SessionUpdate};
use crate::{retry_with_backoff, CaptureError, Metrics, RetryPolicy, StoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backing store for session records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    async fn put(&self, record: SessionRecord) -> Result<(), CaptureError>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, CaptureError>;

    async fn delete(&self, id: &str) -> Result<(), CaptureError>;

    async fn list(&self) -> Result<Vec<SessionRecord>, CaptureError>;
}

pub struct SessionStore {
    cache: DashMap<String, Session>,
    archives: DashMap<String, Bytes>,
    durable: Arc<dyn DurableStore>,
    write_retry: RetryPolicy,
    retention: Duration,
    metrics: Arc<Metrics>,
}

impl SessionStore {
    pub fn new(config: &StoreConfig, durable: Arc<dyn DurableStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            cache: DashMap::new(),
            archives: DashMap::new(),
            durable,
            write_retry: config.write_retry.clone(),
            retention: config.retention,
            metrics,
        }
    }

    pub async fn create(&self, session: Session) -> Result<(), CaptureError> {
        debug!("Creating session {}", session.session_id);
        self.cache
            .insert(session.session_id.clone(), session.clone());
        self.mirror(&session).await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, CaptureError> {
        if let Some(session) = self.cache.get(id) {
            return Ok(Some(session.clone()));
        }

        let Some(record) = self.durable.get(id).await? else {
            return Ok(None);
        };
        let session = Session::try_from(record)?;
        self.cache.insert(id.to_string(), session.clone());
        Ok(Some(session))
    }

    /// Applies `update` and returns the new state. Status changes that would
    /// move the session backwards are rejected.
    pub async fn update(&self, id: &str, update: SessionUpdate) -> Result<Session, CaptureError> {
        if !self.cache.contains_key(id) && self.get(id).await?.is_none() {
            return Err(CaptureError::SessionNotFound(id.to_string()));
        }

        let updated = {
            let mut entry = self
                .cache
                .get_mut(id)
                .ok_or_else(|| CaptureError::SessionNotFound(id.to_string()))?;
            entry.apply(update)?;
            entry.clone()
        };

        self.mirror(&updated).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CaptureError> {
        self.cache.remove(id);
        self.archives.remove(id);

        let durable = self.durable.clone();
        let result = retry_with_backoff(
            &self.write_retry,
            |_| {
                let durable = durable.clone();
                let id = id.to_string();
                async move { durable.delete(&id).await }
            },
            CaptureError::is_retryable,
        )
        .await;

        if let Err(e) = result {
            warn!("Durable delete of session {} failed: {}", id, e);
            self.metrics.store_write_failures.increment(1);
        }
        Ok(())
    }

    /// Every known session, newest first. Durable-only sessions are included
    /// when the durable store can be read.
    pub async fn list_all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.cache.iter().map(|e| e.value().clone()).collect();

        match self.durable.list().await {
            Ok(records) => {
                for record in records {
                    if self.cache.contains_key(&record.id) {
                        continue;
                    }
                    match Session::try_from(record) {
                        Ok(session) => sessions.push(session),
                        Err(e) => warn!("Skipping unreadable session record: {}", e),
                    }
                }
            }
            Err(e) => warn!("Failed to list durable sessions: {}", e),
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn attach_archive(&self, id: &str, archive: Vec<u8>) {
        self.archives.insert(id.to_string(), Bytes::from(archive));
    }

    /// Cheap handle to the archive bytes; no copy is made.
    pub fn archive(&self, id: &str) -> Option<Bytes> {
        self.archives.get(id).map(|a| a.value().clone())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drops cached sessions (and their archives) created more than the
    /// retention window before `now`.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let retention = match chrono::Duration::from_std(self.retention) {
            Ok(retention) => retention,
            Err(_) => return 0,
        };
        let cutoff = now - retention;

        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|e| e.value().created_at < cutoff)
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.cache.remove(id);
            self.archives.remove(id);
        }
        if !expired.is_empty() {
            info!("Swept {} expired session(s)", expired.len());
        }
        expired.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        })
    }

    async fn mirror(&self, session: &Session) {
        let record = match SessionRecord::try_from(session) {
            Ok(record) => record,
            Err(e) => {
                warn!("Session {} could not be serialized: {}", session.session_id, e);
                self.metrics.store_write_failures.increment(1);
                return;
            }
        };

        let durable = self.durable.clone();
        let result = retry_with_backoff(
            &self.write_retry,
            |_| {
                let durable = durable.clone();
                let record = record.clone();
                async move { durable.put(record).await }
            },
            CaptureError::is_retryable,
        )
        .await;

        if let Err(e) = result {
            warn!(
                "Durable write of session {} failed after {} attempt(s): {}",
                session.session_id, self.write_retry.max_attempts, e
            );
            self.metrics.store_write_failures.increment(1);
        }
    }
}

/// SQLite-backed [`DurableStore`]. Statements run on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CaptureError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CaptureError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS capture_sessions (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                result      TEXT,
                error       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_capture_sessions_created
                ON capture_sessions (created_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, CaptureError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CaptureError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || op(&conn.lock())).await?
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            status: row.get(1)?,
            result: row.get(2)?,
            error: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }
}

struct RawRow {
    id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl TryFrom<RawRow> for SessionRecord {
    type Error = CaptureError;

    fn try_from(row: RawRow) -> Result<Self, Self::Error> {
        Ok(SessionRecord {
            id: row.id,
            status: row.status,
            result: row.result,
            error: row.error,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
            finished_at: row.finished_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, CaptureError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CaptureError::StoreReadFailure(format!("bad timestamp {value}: {e}")))
}

const SELECT_COLUMNS: &str =
    "SELECT id, status, result, error, created_at, updated_at, finished_at FROM capture_sessions";

#[async_trait]
impl DurableStore for SqliteStore {
    async fn put(&self, record: SessionRecord) -> Result<(), CaptureError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO capture_sessions
                    (id, status, result, error, created_at, updated_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    result = excluded.result,
                    error = excluded.error,
                    updated_at = excluded.updated_at,
                    finished_at = excluded.finished_at",
                params![
                    record.id,
                    record.status,
                    record.result,
                    record.error,
                    format_time(&record.created_at),
                    format_time(&record.updated_at),
                    record.finished_at.as_ref().map(format_time),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, CaptureError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    params![id],
                    Self::map_row,
                )
                .optional()
                .map_err(|e| CaptureError::StoreReadFailure(e.to_string()))?;
            row.map(SessionRecord::try_from).transpose()
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), CaptureError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM capture_sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, CaptureError> {
        self.with_conn(|conn| {
            let read_err = |e: rusqlite::Error| CaptureError::StoreReadFailure(e.to_string());
            let mut stmt = conn
                .prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
                .map_err(read_err)?;
            let rows = stmt
                .query_map([], Self::map_row)
                .map_err(read_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_err)?;
            rows.into_iter().map(SessionRecord::try_from).collect()
        })
        .await
    }
}
