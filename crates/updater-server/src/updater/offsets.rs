//! Durable stream offsets
//!
//! Keys end in [`OFFSET_SUFFIX`] so a full run can find and clear every
//! offset it owns with one suffix listing. Cursors are opaque to the store;
//! the fetcher encodes a [`StreamPosition`] into them.

use crate::db::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

pub const OFFSET_SUFFIX: &str = "-offset";

/// Offset key for a stream pass, e.g. `enrolments-offset`.
pub fn offset_key(stream_key: &str) -> String {
    format!("{stream_key}{OFFSET_SUFFIX}")
}

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, cursor: &str) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn list_keys_matching(&self, suffix: &str) -> StoreResult<Vec<String>>;
}

/// Delete every stream offset so the next fetch starts from its default.
pub async fn clear_all(store: &dyn OffsetStore) -> StoreResult<usize> {
    let keys = store.list_keys_matching(OFFSET_SUFFIX).await?;
    for key in &keys {
        store.delete(key).await?;
    }
    info!(cleared = keys.len(), "Cleared stream offsets");
    Ok(keys.len())
}

/// Position inside a stream: the `since` filter the stream was opened with
/// and the number of records consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub offset: u64,
}

impl StreamPosition {
    pub fn starting_at(since: Option<DateTime<Utc>>) -> Self {
        Self { since, offset: 0 }
    }

    pub fn advance(self, consumed: usize) -> Self {
        Self {
            offset: self.offset + consumed as u64,
            ..self
        }
    }

    pub fn encode(&self) -> StoreResult<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn decode(cursor: &str) -> StoreResult<Self> {
        serde_json::from_str(cursor)
            .map_err(|e| StoreError::Corrupt(format!("stream cursor '{cursor}': {e}")))
    }
}

/// `stream_offsets` table adapter
#[derive(Clone)]
pub struct PgOffsetStore {
    pool: PgPool,
}

impl PgOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OffsetStore for PgOffsetStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let cursor = sqlx::query_scalar::<_, String>("SELECT cursor FROM stream_offsets WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(cursor)
    }

    async fn set(&self, key: &str, cursor: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_offsets (key, cursor, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(cursor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM stream_offsets WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_keys_matching(&self, suffix: &str) -> StoreResult<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM stream_offsets WHERE right(key, length($1)) = $1 ORDER BY key",
        )
        .bind(suffix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }
}
