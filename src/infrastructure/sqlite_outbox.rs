//! SQLite-backed outbox store.
//!
//! The table lives in the application's own database so that an outbox row
//! can be written in the same transaction as the business change it
//! describes (see [`SqliteOutboxStore::insert_in_tx`]). Claims use a
//! conditional `UPDATE` guarded by the row's current status, attempts and
//! claim, so two processors never own the same row.
//!
//! Timestamps are stored as Unix milliseconds.

use crate::application::ports::{OutboxStore, StoreError};
use crate::domain::outbox::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbox_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    aggregate_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    processed_at INTEGER,
    claim_token TEXT,
    claim_expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON outbox_messages(status, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox_messages(aggregate_type, aggregate_id);
";

const COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, status, \
     attempts, max_attempts, error_message, created_at, updated_at, processed_at, \
     claim_token, claim_expires_at";

/// Rows a processor may take: the claimable states of an outbox message.
const CLAIMABLE: &str = "(status = 'pending' \
     OR (status = 'failed' AND attempts < max_attempts) \
     OR (status = 'processing' AND attempts < max_attempts \
         AND (claim_expires_at IS NULL OR claim_expires_at <= ?1)))";

#[derive(Debug, Clone)]
pub struct SqliteOutboxStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOutboxStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(backend)?)
    }

    /// Wrap an existing connection, creating the table if needed.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the outbox table on a caller-owned connection.
    pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)
    }

    /// Append a message inside the caller's transaction.
    ///
    /// The row becomes visible to processors only when `tx` commits, and
    /// disappears with it on rollback.
    pub fn insert_in_tx(
        tx: &Transaction<'_>,
        message: NewOutboxMessage,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        insert_row(tx, message, now)
    }

    /// Run `f` on the shared connection from the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                StoreError::Unavailable("sqlite connection mutex poisoned".to_string())
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert(&self, message: NewOutboxMessage) -> Result<u64, StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| insert_row(conn, message, now)).await
    }

    async fn claim_batch(
        &self,
        limit: usize,
        token: Uuid,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let visibility_ms = i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX / 2);
        let expires_at = now.timestamp_millis() + visibility_ms;

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let now_ms = now.timestamp_millis();

            let abandoned = tx
                .execute(
                    "UPDATE outbox_messages
                     SET status = 'failed', error_message = 'claim expired after final attempt',
                         updated_at = ?1, claim_token = NULL, claim_expires_at = NULL
                     WHERE status = 'processing' AND attempts >= max_attempts
                       AND (claim_expires_at IS NULL OR claim_expires_at <= ?1)",
                    params![now_ms],
                )
                .map_err(backend)?;
            if abandoned > 0 {
                tracing::warn!(count = abandoned, "Outbox claims expired after final attempt");
            }

            let candidates: Vec<i64> = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT id FROM outbox_messages WHERE {CLAIMABLE}
                         ORDER BY created_at, id LIMIT ?2"
                    ))
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(params![now_ms, limit as i64], |row| row.get(0))
                    .map_err(backend)?;
                rows.collect::<Result<_, _>>().map_err(backend)?
            };

            let token_text = token.to_string();
            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                // Re-check the claimable predicate so a concurrent claimer wins cleanly
                let updated = tx
                    .execute(
                        &format!(
                            "UPDATE outbox_messages
                             SET status = 'processing', attempts = attempts + 1,
                                 claim_token = ?2, claim_expires_at = ?3, updated_at = ?1
                             WHERE id = ?4 AND {CLAIMABLE}"
                        ),
                        params![now_ms, token_text, expires_at, id],
                    )
                    .map_err(backend)?;
                if updated == 1 {
                    if let Some(message) = select_by_id(&tx, id)? {
                        claimed.push(message);
                    }
                }
            }

            tx.commit().map_err(backend)?;
            Ok(claimed)
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: u64,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE outbox_messages
                     SET status = 'completed', processed_at = ?1, updated_at = ?1,
                         claim_token = NULL, claim_expires_at = NULL
                     WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
                    params![now.timestamp_millis(), to_sql_id(id)?, token.to_string()],
                )
                .map_err(backend)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: u64,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE outbox_messages
                     SET status = 'failed', error_message = ?1, updated_at = ?2,
                         claim_token = NULL, claim_expires_at = NULL
                     WHERE id = ?3 AND status = 'processing' AND claim_token = ?4",
                    params![error, now.timestamp_millis(), to_sql_id(id)?, token.to_string()],
                )
                .map_err(backend)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn release(&self, id: u64, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE outbox_messages
                     SET status = CASE WHEN error_message IS NULL THEN 'pending' ELSE 'failed' END,
                         attempts = MAX(attempts - 1, 0), updated_at = ?1,
                         claim_token = NULL, claim_expires_at = NULL
                     WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
                    params![now.timestamp_millis(), to_sql_id(id)?, token.to_string()],
                )
                .map_err(backend)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn get(&self, id: u64) -> Result<Option<OutboxMessage>, StoreError> {
        self.with_conn(move |conn| select_by_id(conn, to_sql_id(id)?)).await
    }

    async fn list(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM outbox_messages WHERE status = ?1
                     ORDER BY created_at, id LIMIT ?2"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![status.as_str(), limit as i64], read_row)
                .map_err(backend)?;
            let raw: Vec<RawRow> = rows.collect::<Result<_, _>>().map_err(backend)?;
            raw.into_iter().map(RawRow::into_message).collect()
        })
        .await
    }

    async fn count_by_status(&self) -> Result<BTreeMap<OutboxStatus, u64>, StoreError> {
        self.with_conn(|conn| {
            let mut counts: BTreeMap<OutboxStatus, u64> =
                OutboxStatus::ALL.iter().map(|s| (*s, 0)).collect();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(backend)?;
            for row in rows {
                let (status, count) = row.map_err(backend)?;
                let status: OutboxStatus = status.parse().map_err(StoreError::Backend)?;
                counts.insert(status, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_sql_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Backend(format!("outbox id {id} out of range")))
}

fn insert_row(
    conn: &Connection,
    message: NewOutboxMessage,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let now_ms = now.timestamp_millis();
    conn.execute(
        "INSERT INTO outbox_messages
         (aggregate_id, aggregate_type, event_type, payload, status, attempts, max_attempts,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6)",
        params![
            message.aggregate_id,
            message.aggregate_type,
            message.event_type,
            message.payload,
            message.max_attempts,
            now_ms
        ],
    )
    .map_err(backend)?;
    Ok(conn.last_insert_rowid() as u64)
}

fn select_by_id(conn: &Connection, id: i64) -> Result<Option<OutboxMessage>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = ?1"),
        params![id],
        read_row,
    )
    .optional()
    .map_err(backend)?
    .map(RawRow::into_message)
    .transpose()
}

/// Column values before domain conversion.
struct RawRow {
    id: i64,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    attempts: u32,
    max_attempts: u32,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
    processed_at: Option<i64>,
    claim_token: Option<String>,
    claim_expires_at: Option<i64>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        aggregate_id: row.get(1)?,
        aggregate_type: row.get(2)?,
        event_type: row.get(3)?,
        payload: row.get(4)?,
        status: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        processed_at: row.get(11)?,
        claim_token: row.get(12)?,
        claim_expires_at: row.get(13)?,
    })
}

impl RawRow {
    fn into_message(self) -> Result<OutboxMessage, StoreError> {
        let claim_token = self
            .claim_token
            .map(|t| Uuid::parse_str(&t))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("invalid claim token: {e}")))?;

        Ok(OutboxMessage {
            id: self.id as u64,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            payload: self.payload,
            status: self.status.parse().map_err(StoreError::Backend)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error_message: self.error_message,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            processed_at: self.processed_at.map(from_millis).transpose()?,
            claim_token,
            claim_expires_at: self.claim_expires_at.map(from_millis).transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(60);

    fn new_message() -> NewOutboxMessage {
        NewOutboxMessage::new("order", "42", "OrderCreated", br#"{"total":10}"#.to_vec())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteOutboxStore::in_memory().unwrap();
        let id = store.insert(new_message()).await.unwrap();

        let message = store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Pending);
        assert_eq!(message.event_type, "OrderCreated");
        assert_eq!(message.payload, br#"{"total":10}"#.to_vec());
        assert!(store.get(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_conditional_on_token() {
        let store = SqliteOutboxStore::in_memory().unwrap();
        let id = store.insert(new_message()).await.unwrap();
        let now = Utc::now();

        let token = Uuid::new_v4();
        let claimed = store.claim_batch(10, token, now, VISIBILITY).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].claim_token, Some(token));
        assert_eq!(claimed[0].attempts, 1);

        assert!(store.claim_batch(10, Uuid::new_v4(), now, VISIBILITY).await.unwrap().is_empty());
        assert!(!store.mark_completed(id, Uuid::new_v4(), now).await.unwrap());
        assert!(store.mark_completed(id, token, now).await.unwrap());

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&OutboxStatus::Completed], 1);
        assert_eq!(counts[&OutboxStatus::Pending], 0);
    }

    #[tokio::test]
    async fn test_release_restores_status_and_attempts() {
        let store = SqliteOutboxStore::in_memory().unwrap();
        let id = store.insert(new_message()).await.unwrap();
        let now = Utc::now();

        let first = Uuid::new_v4();
        store.claim_batch(10, first, now, VISIBILITY).await.unwrap();
        assert!(store.mark_failed(id, first, "nack", now).await.unwrap());

        let second = Uuid::new_v4();
        store.claim_batch(10, second, now, VISIBILITY).await.unwrap();
        assert!(!store.release(id, first, now).await.unwrap());
        assert!(store.release(id, second, now).await.unwrap());

        let message = store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.claim_token, None);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_row() {
        let store = SqliteOutboxStore::in_memory().unwrap();
        {
            let conn = Arc::clone(&store.conn);
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            SqliteOutboxStore::insert_in_tx(&tx, new_message(), Utc::now()).unwrap();
            tx.rollback().unwrap();
        }
        assert!(store.list(OutboxStatus::Pending, 10).await.unwrap().is_empty());
    }
}
