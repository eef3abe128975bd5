//! Idempotent bulk writer
//!
//! A merge first tries one set-oriented insert-or-update for the whole batch.
//! When that fails with a row-scoped error (see
//! [`StoreError::is_row_scoped`]), every row is retried on its own with the
//! same conflict policy; rows that still fail are logged with their payload
//! and reported as skipped. Any other failure aborts the merge.

use crate::db::StoreError;
use crate::models::Entity;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

/// What to do when an incoming row collides with a stored one on its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the stored row untouched.
    Ignore,
    /// Overwrite exactly these columns with the incoming values.
    Update(&'static [&'static str]),
}

/// Storage able to merge rows of `E`.
#[async_trait]
pub trait MergeTarget<E: Entity>: Send + Sync {
    /// Merge all rows atomically, returning the stored versions of the rows
    /// that were inserted or updated.
    async fn merge_batch(&self, rows: &[E], policy: ConflictPolicy) -> Result<Vec<E>, StoreError>;

    /// Merge one row. `None` when the policy left a stored row untouched.
    async fn merge_row(&self, row: &E, policy: ConflictPolicy) -> Result<Option<E>, StoreError>;
}

/// A row the fallback path could not write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub entity: &'static str,
    pub payload: serde_json::Value,
    pub reason: String,
}

impl SkippedRow {
    /// Report `row` as skipped. A row that cannot be serialized keeps a null
    /// payload and carries the serialization error in its reason.
    pub fn new<E: Entity>(row: &E, reason: String) -> Self {
        match serde_json::to_value(row) {
            Ok(payload) => Self {
                entity: E::NAME,
                payload,
                reason,
            },
            Err(e) => {
                warn!(entity = E::NAME, row = ?row, error = %e, "Skipped row could not be serialized");
                Self {
                    entity: E::NAME,
                    payload: serde_json::Value::Null,
                    reason: format!("{reason} (payload not serializable: {e})"),
                }
            },
        }
    }
}

#[derive(Debug)]
pub struct MergeOutcome<E> {
    pub written: Vec<E>,
    pub skipped: Vec<SkippedRow>,
    /// Whether the batch went through the per-row path.
    pub fell_back: bool,
}

impl<E> MergeOutcome<E> {
    fn empty() -> Self {
        Self {
            written: Vec::new(),
            skipped: Vec::new(),
            fell_back: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkWriter {
    row_concurrency: usize,
}

impl Default for BulkWriter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ROW_CONCURRENCY)
    }
}

impl BulkWriter {
    pub fn new(row_concurrency: usize) -> Self {
        Self {
            row_concurrency: row_concurrency.max(1),
        }
    }

    pub async fn merge<E, T>(
        &self,
        target: &T,
        rows: Vec<E>,
        policy: ConflictPolicy,
    ) -> Result<MergeOutcome<E>, StoreError>
    where
        E: Entity,
        T: MergeTarget<E> + ?Sized,
    {
        if rows.is_empty() {
            return Ok(MergeOutcome::empty());
        }

        match target.merge_batch(&rows, policy).await {
            Ok(written) => {
                debug!(entity = E::NAME, rows = rows.len(), written = written.len(), "Batch merged");
                Ok(MergeOutcome {
                    written,
                    skipped: Vec::new(),
                    fell_back: false,
                })
            },
            Err(e) if e.is_row_scoped() => {
                warn!(
                    entity = E::NAME,
                    rows = rows.len(),
                    error = %e,
                    "Batch merge failed, merging rows one by one"
                );
                self.merge_rows(target, rows, policy).await
            },
            Err(e) => Err(e),
        }
    }

    async fn merge_rows<E, T>(
        &self,
        target: &T,
        rows: Vec<E>,
        policy: ConflictPolicy,
    ) -> Result<MergeOutcome<E>, StoreError>
    where
        E: Entity,
        T: MergeTarget<E> + ?Sized,
    {
        let results: Vec<(E, Result<Option<E>, StoreError>)> = stream::iter(rows)
            .map(|row| async move {
                let result = target.merge_row(&row, policy).await;
                (row, result)
            })
            .buffered(self.row_concurrency)
            .collect()
            .await;

        let mut outcome = MergeOutcome {
            fell_back: true,
            ..MergeOutcome::empty()
        };

        for (row, result) in results {
            match result {
                Ok(Some(stored)) => outcome.written.push(stored),
                Ok(None) => {},
                Err(e) if e.is_row_scoped() => {
                    let skipped = SkippedRow::new(&row, e.to_string());
                    warn!(entity = E::NAME, payload = %skipped.payload, error = %e, "Skipping row");
                    outcome.skipped.push(skipped);
                },
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }
}
