//! Updater Server Library
//!
//! Reconciles importer data (persons, organisations, course units,
//! realisations and enrolments) into the feedback database.
//!
//! # Overview
//!
//! - **Pipeline**: six dependent stages run strictly in order, each page of
//!   each upstream stream merged idempotently
//! - **Job Runs**: every full run is recorded; runs left RUNNING by a crash
//!   are resumed or marked INTERRUPTED at startup
//! - **Offsets**: per-stream cursors persisted after every processed page so
//!   a resumed run repeats at most one page
//! - **Front door**: a small axum router to trigger runs and ad-hoc updates
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use updater_server::store::PgStore;
//! use updater_server::updater::importer::ImporterClient;
//! use updater_server::updater::job_run::PgJobRunStore;
//! use updater_server::updater::offsets::PgOffsetStore;
//! use updater_server::updater::reconcile::similarity::NormalizedLevenshtein;
//! use updater_server::updater::{Orchestrator, Pipeline, PipelineSettings};
//!
//! # async fn example(pool: sqlx::PgPool, importer: ImporterClient) -> anyhow::Result<()> {
//! let pipeline = Pipeline::new(
//!     Arc::new(PgStore::new(pool.clone())),
//!     Arc::new(PgOffsetStore::new(pool.clone())),
//!     Arc::new(importer),
//!     Arc::new(NormalizedLevenshtein),
//!     PipelineSettings::default(),
//! );
//! let orchestrator = Orchestrator::new(Arc::new(pipeline), Arc::new(PgJobRunStore::new(pool)), false);
//! orchestrator.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod store;
pub mod updater;

pub use error::AppError;
