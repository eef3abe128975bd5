//! Database pool and storage error types

use crate::config::DatabaseConfig;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;

/// SQLSTATE for "ON CONFLICT DO UPDATE command cannot affect row a second time".
const CARDINALITY_VIOLATION: &str = "21000";

/// SQLSTATE class for data exceptions (bad dates, overflow, invalid text).
const DATA_EXCEPTION_CLASS: &str = "22";

/// Storage operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A single row broke a storage constraint
    #[error("{entity} violates {constraint}")]
    Constraint {
        entity: &'static str,
        constraint: String,
    },

    /// Another job run of the same type holds the run lease
    #[error("A {0} job run is already in progress")]
    AlreadyRunning(String),

    #[error("{0}")]
    NotFound(String),

    /// Stored value cannot be interpreted
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn constraint(entity: &'static str, constraint: impl Into<String>) -> Self {
        Self::Constraint {
            entity,
            constraint: constraint.into(),
        }
    }

    /// Whether the failure is confined to the offending rows.
    ///
    /// Row-scoped failures send the bulk writer down its per-row path; all
    /// other failures (connectivity, pool exhaustion, decoding) abort the stage.
    pub fn is_row_scoped(&self) -> bool {
        match self {
            StoreError::Constraint { .. } => true,
            StoreError::Sqlx(sqlx::Error::Database(db)) => {
                matches!(
                    db.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) || db.code().is_some_and(|code| {
                    code == CARDINALITY_VIOLATION || code.starts_with(DATA_EXCEPTION_CLASS)
                })
            },
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlx(sqlx::Error::Database(db)) if db.kind() == ErrorKind::UniqueViolation
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub async fn create_pool(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> StoreResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(StoreError::from)
}
