//! Job run records and their state machine
//!
//! ```text
//! RUNNING ──▶ FINISHED
//!    │──────▶ FAILURE
//!    └──────▶ INTERRUPTED
//! ```
//!
//! RUNNING is the only non-terminal state. Rows are never deleted.

use crate::db::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job type of the scheduled full pipeline.
pub const NIGHTLY_JOB: &str = "NIGHTLY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Finished,
    Failure,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failure => "FAILURE",
            JobStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(JobStatus::Running),
            "FINISHED" => Ok(JobStatus::Finished),
            "FAILURE" => Ok(JobStatus::Failure),
            "INTERRUPTED" => Ok(JobStatus::Interrupted),
            other => Err(StoreError::Corrupt(format!("unknown job status '{other}'"))),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One execution of the pipeline (maps to `job_runs`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct JobRun {
    pub id: Uuid,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[async_trait]
pub trait JobRunStore: Send + Sync {
    /// Insert a RUNNING row. Fails with [`StoreError::AlreadyRunning`] while
    /// another run of the same type is RUNNING.
    async fn create_running(&self, job_type: &str) -> StoreResult<JobRun>;

    /// Move a RUNNING row to a terminal status and stamp `finished_at`.
    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<&str>) -> StoreResult<()>;

    /// Runs with `status`, newest first.
    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<JobRun>>;

    async fn latest(&self, limit: i64) -> StoreResult<Vec<JobRun>>;
}

/// `job_runs` table adapter
#[derive(Clone)]
pub struct PgJobRunStore {
    pool: PgPool,
}

impl PgJobRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRunStore for PgJobRunStore {
    async fn create_running(&self, job_type: &str) -> StoreResult<JobRun> {
        let result = sqlx::query_as::<_, JobRun>(
            r#"
            INSERT INTO job_runs (id, job_type, status, started_at)
            VALUES ($1, $2, 'RUNNING', NOW())
            RETURNING id, job_type, status, started_at, finished_at, error
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_type)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from);

        match result {
            Err(e) if e.is_unique_violation() => Err(StoreError::AlreadyRunning(job_type.to_string())),
            other => other,
        }
    }

    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, finished_at = NOW(), error = $3
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("RUNNING job run '{id}' not found")));
        }

        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(
            r#"
            SELECT id, job_type, status, started_at, finished_at, error
            FROM job_runs
            WHERE status = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    async fn latest(&self, limit: i64) -> StoreResult<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(
            r#"
            SELECT id, job_type, status, started_at, finished_at, error
            FROM job_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }
}
