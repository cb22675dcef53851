//! SQLite-backed `Store`.
//!
//! Quota counters live in one row per (subject, action); the increment is a
//! single `INSERT .. ON CONFLICT DO UPDATE .. RETURNING` statement, so it stays
//! atomic across connections and processes sharing the database file.
//! Timestamps are taken from the store's clock and kept as unix milliseconds.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftb_core::{
    clock::{Clock, SystemClock},
    domain::{Action, QuotaKey, Subject},
    ports::{Collection, QuotaRecord, Store},
    Error, Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS quotas (
        subject TEXT NOT NULL,
        action TEXT NOT NULL,
        count INTEGER NOT NULL,
        window_start_ms INTEGER NOT NULL,
        window_ms INTEGER NOT NULL,
        quota_limit INTEGER NOT NULL,
        observed_ms INTEGER NOT NULL,
        PRIMARY KEY (subject, action)
    );

    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection TEXT NOT NULL,
        created_ms INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_collection_created
        ON documents(collection, created_ms);
"#;

// A window expires once strictly more than window_ms has passed; a clock that
// went backwards counts as zero elapsed.
const UPSERT_INCREMENT: &str = r#"
    INSERT INTO quotas (subject, action, count, window_start_ms, window_ms, quota_limit, observed_ms)
    VALUES (?1, ?2, 1, ?3, ?4, ?5, ?3)
    ON CONFLICT (subject, action) DO UPDATE SET
        count = CASE WHEN MAX(?3 - quotas.window_start_ms, 0) > ?4
                     THEN 1 ELSE quotas.count + 1 END,
        window_start_ms = CASE WHEN MAX(?3 - quotas.window_start_ms, 0) > ?4
                     THEN ?3 ELSE quotas.window_start_ms END,
        window_ms = ?4,
        quota_limit = ?5,
        observed_ms = ?3
    RETURNING count, window_start_ms, observed_ms
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sqlite_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sqlite_error)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(sqlite_error)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::StoreUnavailable("sqlite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        window: Duration,
    ) -> Result<QuotaRecord> {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = i64::try_from(window.as_millis())
            .map_err(|_| Error::Config(format!("quota window too large: {window:?}")))?;
        let key = key.clone();

        self.with_conn(move |conn| {
            let (count, start_ms, observed_ms): (i64, i64, i64) = conn
                .query_row(
                    UPSERT_INCREMENT,
                    params![key.subject.as_str(), key.action.as_str(), now_ms, window_ms, limit],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(sqlite_error)?;
            debug!(key = %key.document_key(), count, "quota incremented");
            Ok(QuotaRecord {
                subject: key.subject,
                action: key.action,
                count: u32::try_from(count).unwrap_or(u32::MAX),
                window_start: from_millis(start_ms)?,
                window_length: window,
                limit,
                observed_at: from_millis(observed_ms)?,
            })
        })
        .await
    }

    async fn insert(&self, collection: Collection, document: serde_json::Value) -> Result<u64> {
        if collection == Collection::Quotas {
            return Err(Error::Config(
                "quota documents are written through upsert_increment".to_string(),
            ));
        }
        let created_ms = self.clock.now().timestamp_millis();
        let body = serde_json::to_string(&document)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (collection, created_ms, body) VALUES (?1, ?2, ?3)",
                params![collection.as_str(), created_ms, body],
            )
            .map_err(sqlite_error)?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn find_one(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        match collection {
            Collection::Quotas => {
                // Subjects may contain ':' ("user:42"); action names never do.
                let Some((subject, action)) = key.rsplit_once(':') else {
                    return Ok(None);
                };
                let (subject, action) = (subject.to_string(), action.to_string());
                self.with_conn(move |conn| {
                    let row = conn
                        .query_row(
                            "SELECT count, window_start_ms, window_ms, quota_limit, observed_ms
                             FROM quotas WHERE subject = ?1 AND action = ?2",
                            params![subject, action],
                            |row| {
                                Ok((
                                    row.get::<_, i64>(0)?,
                                    row.get::<_, i64>(1)?,
                                    row.get::<_, i64>(2)?,
                                    row.get::<_, u32>(3)?,
                                    row.get::<_, i64>(4)?,
                                ))
                            },
                        )
                        .optional()
                        .map_err(sqlite_error)?;
                    let Some((count, start_ms, window_ms, limit, observed_ms)) = row else {
                        return Ok(None);
                    };
                    let record = QuotaRecord {
                        subject: Subject::new(subject),
                        action: Action::new(action),
                        count: u32::try_from(count).unwrap_or(u32::MAX),
                        window_start: from_millis(start_ms)?,
                        window_length: Duration::from_millis(window_ms.max(0) as u64),
                        limit,
                        observed_at: from_millis(observed_ms)?,
                    };
                    Ok(Some(serde_json::to_value(record)?))
                })
                .await
            }
            Collection::Activity | Collection::Errors => {
                let Ok(id) = key.parse::<i64>() else {
                    return Ok(None);
                };
                self.with_conn(move |conn| {
                    let body: Option<String> = conn
                        .query_row(
                            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                            params![collection.as_str(), id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(sqlite_error)?;
                    match body {
                        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                        None => Ok(None),
                    }
                })
                .await
            }
        }
    }

    async fn prune(&self, collection: Collection, older_than: DateTime<Utc>) -> Result<u64> {
        if collection == Collection::Quotas {
            return Ok(0);
        }
        let cutoff_ms = older_than.timestamp_millis();
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM documents WHERE collection = ?1 AND created_ms < ?2",
                    params![collection.as_str(), cutoff_ms],
                )
                .map_err(sqlite_error)?;
            Ok(removed as u64)
        })
        .await
    }
}

fn sqlite_error(e: rusqlite::Error) -> Error {
    Error::StoreUnavailable(format!("sqlite: {e}"))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::StoreUnavailable(format!("stored timestamp out of range: {ms}")))
}
