use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;

/// A failed record captured for later replay. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPayload {
    pub route: String,
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("retry store unavailable")]
    Unavailable,
}

/// Durable sink for records a handler asked to reprocess later.
///
/// Appends are at-least-once: duplicates after a crash are acceptable, silent
/// loss is not. Implementations must tolerate concurrent appends from many
/// consumer instances without losing writes.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Durably capture a payload. Must not return `Ok` before the payload is
    /// persisted.
    async fn append(&self, payload: RetryPayload) -> Result<(), RetryStoreError>;

    /// Remove and return up to `max` payloads for a route, oldest first.
    async fn drain(&self, route: &str, max: usize) -> Result<Vec<RetryPayload>, RetryStoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    id BIGSERIAL PRIMARY KEY,
    route TEXT NOT NULL,
    key BYTEA NOT NULL,
    value BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const SCHEMA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS dead_letters_route_idx ON dead_letters (route, id)";

const APPEND_QUERY: &str = "INSERT INTO dead_letters (route, key, value) VALUES ($1, $2, $3)";

// SKIP LOCKED so concurrent drains never hand out the same payload twice.
const DRAIN_QUERY: &str = r#"
DELETE FROM dead_letters
WHERE id IN (
    SELECT id FROM dead_letters
    WHERE route = $1
    ORDER BY id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING route, key, value
"#;

/// Postgres-backed retry store. One `dead_letters` table shared by all
/// routes.
pub struct PgRetryStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    route: String,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl PgRetryStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, RetryStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `dead_letters` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), RetryStoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(SCHEMA_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RetryStore for PgRetryStore {
    async fn append(&self, payload: RetryPayload) -> Result<(), RetryStoreError> {
        sqlx::query(APPEND_QUERY)
            .bind(&payload.route)
            .bind(&payload.key[..])
            .bind(&payload.value[..])
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drain(&self, route: &str, max: usize) -> Result<Vec<RetryPayload>, RetryStoreError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(DRAIN_QUERY)
            .bind(route)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| RetryPayload {
                route: row.route,
                key: Bytes::from(row.key),
                value: Bytes::from(row.value),
            })
            .collect())
    }
}

/// In-memory retry store for tests and local runs. Durable only for the
/// lifetime of the process.
#[derive(Default)]
pub struct MemoryRetryStore {
    entries: Mutex<HashMap<String, VecDeque<RetryPayload>>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, route: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(route)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn append(&self, payload: RetryPayload) -> Result<(), RetryStoreError> {
        self.entries
            .lock()
            .await
            .entry(payload.route.clone())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn drain(&self, route: &str, max: usize) -> Result<Vec<RetryPayload>, RetryStoreError> {
        let mut entries = self.entries.lock().await;
        let Some(queue) = entries.get_mut(route) else {
            return Ok(Vec::new());
        };
        let count = max.min(queue.len());
        Ok(queue.drain(..count).collect())
    }
}
