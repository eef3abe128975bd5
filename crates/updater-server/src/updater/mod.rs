//! Reconciliation of importer data into the feedback database
//!
//! Leaf first:
//!
//! - [`importer`]: typed importer client and the not-ready protocol
//! - [`offsets`]: durable per-stream cursors
//! - [`fetcher`]: drains one stream page by page, advancing offsets only
//!   after the page handler succeeded
//! - [`bulk`]: set-oriented merges with a per-row fallback
//! - [`reconcile`]: record mapping, matching and tie-break rules
//! - [`pipeline`]: the six stages and the ad-hoc operations
//! - [`orchestrator`]: job run state machine and startup recovery
//! - [`scheduler`]: cron triggers

pub mod bulk;
pub mod fetcher;
pub mod importer;
pub mod job_run;
pub mod offsets;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod scheduler;

pub use orchestrator::{Orchestrator, PipelineError, Recovery, RunSummary};
pub use pipeline::{Pipeline, PipelineSettings, Stage};
