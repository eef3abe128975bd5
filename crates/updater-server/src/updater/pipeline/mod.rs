//! Reconciliation pipeline
//!
//! Six stages run in dependency order, each assuming the previous ones
//! committed:
//!
//! 1. Persons
//! 2. Organisations
//! 3. Course units, realisations, feedback targets and teacher assignments
//! 4. Student enrolments
//! 5. Derived counts
//! 6. Interim feedback membership
//!
//! Streamed stages drain their streams through the [`BatchFetcher`] with a
//! page handler that maps the typed records and merges them with the
//! [`BulkWriter`]. The ad-hoc operations exposed to the HTTP front door reuse
//! the same handlers.

mod courses;
mod derived;
mod enrolments;
mod organisations;
mod persons;
#[cfg(test)]
pub(crate) mod testing;

pub use courses::{COURSES_STREAM, COURSE_UNITS_PASS, OPEN_COURSE_UNITS_PASS, REALISATIONS_PASS};
pub use enrolments::{DELETED_ENROLMENTS_STREAM, ENROLMENTS_STREAM, NEW_ENROLMENTS_PATH};
pub use organisations::ORGANISATIONS_STREAM;
pub use persons::PERSONS_STREAM;

use crate::config::{
    UpdaterConfig, DEFAULT_COURSES_PAGE_SIZE, DEFAULT_ENROLMENTS_PAGE_SIZE, DEFAULT_ENROLMENT_LOOKBACK_YEARS,
    DEFAULT_NEW_ENROLMENTS_WINDOW_HOURS, DEFAULT_ORGANISATIONS_PAGE_SIZE, DEFAULT_PERSONS_PAGE_SIZE,
    DEFAULT_ROW_CONCURRENCY,
};
use crate::db::{StoreError, StoreResult};
use crate::models::Entity;
use crate::store::ReconcileStore;
use crate::updater::bulk::{BulkWriter, ConflictPolicy, MergeTarget, SkippedRow};
use crate::updater::fetcher::{BatchFetcher, FetchError, FetchStats, PageHandler, StreamSpec};
use crate::updater::importer::{ImporterError, UpstreamSource};
use crate::updater::job_run::JobRun;
use crate::updater::offsets::OffsetStore;
use crate::updater::reconcile::cleanup::{delete_cancelled_realisations, CleanupReport};
use crate::updater::reconcile::similarity::NameSimilarity;
use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Europe::Helsinki;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Persons,
    Organisations,
    Courses,
    Enrolments,
    Counts,
    Interim,
}

impl Stage {
    /// Every stage of a full run, in execution order.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Persons,
        Stage::Organisations,
        Stage::Courses,
        Stage::Enrolments,
        Stage::Counts,
        Stage::Interim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Persons => "persons",
            Stage::Organisations => "organisations",
            Stage::Courses => "courses",
            Stage::Enrolments => "enrolments",
            Stage::Counts => "counts",
            Stage::Interim => "interim",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] ImporterError),
}

/// Values fixed for the lifetime of one job run.
///
/// Passed to every stage instead of being read from process-wide state, so
/// two overlapping runs never observe each other's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn for_run(run: &JobRun) -> Self {
        Self {
            run_id: run.id,
            started_at: run.started_at,
        }
    }

    /// Context of an operation outside any job run.
    pub fn ad_hoc() -> Self {
        Self {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
        }
    }

    /// Whether the run started on a Sunday, local time.
    pub fn starts_on_sunday(&self) -> bool {
        self.started_at.with_timezone(&Helsinki).weekday() == Weekday::Sun
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamReport {
    pub key: String,
    #[serde(flatten)]
    pub stats: FetchStats,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub streams: Vec<StreamReport>,
    /// Rows the bulk writer could not store
    pub skipped: Vec<SkippedRow>,
    /// Rows removed by the stage
    pub deleted: u64,
    /// Rows updated outside the bulk writer
    pub updated: u64,
}

impl StageReport {
    fn stream(&mut self, spec: &StreamSpec, stats: FetchStats) {
        self.streams.push(StreamReport {
            key: spec.key.clone(),
            stats,
        });
    }
}

/// How a stage ended.
#[derive(Debug)]
pub enum StageOutcome {
    Success(StageReport),
    /// Finished, but the per-row fallback skipped `report.skipped`
    PartialFailure(StageReport),
    /// Aborted. Later stages must not run.
    Fatal(StageError),
}

impl StageOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::Fatal(_))
    }
}

impl From<Result<StageReport, StageError>> for StageOutcome {
    fn from(result: Result<StageReport, StageError>) -> Self {
        match result {
            Ok(report) if report.skipped.is_empty() => StageOutcome::Success(report),
            Ok(report) => StageOutcome::PartialFailure(report),
            Err(e) => StageOutcome::Fatal(e),
        }
    }
}

/// Page sizes and windows of the streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub persons_page_size: u32,
    pub organisations_page_size: u32,
    pub courses_page_size: u32,
    pub enrolments_page_size: u32,
    pub enrolment_lookback_years: u32,
    pub new_enrolments_window_hours: u32,
    pub row_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            persons_page_size: DEFAULT_PERSONS_PAGE_SIZE,
            organisations_page_size: DEFAULT_ORGANISATIONS_PAGE_SIZE,
            courses_page_size: DEFAULT_COURSES_PAGE_SIZE,
            enrolments_page_size: DEFAULT_ENROLMENTS_PAGE_SIZE,
            enrolment_lookback_years: DEFAULT_ENROLMENT_LOOKBACK_YEARS,
            new_enrolments_window_hours: DEFAULT_NEW_ENROLMENTS_WINDOW_HOURS,
            row_concurrency: DEFAULT_ROW_CONCURRENCY,
        }
    }
}

impl From<&UpdaterConfig> for PipelineSettings {
    fn from(config: &UpdaterConfig) -> Self {
        Self {
            persons_page_size: config.persons_page_size,
            organisations_page_size: config.organisations_page_size,
            courses_page_size: config.courses_page_size,
            enrolments_page_size: config.enrolments_page_size,
            enrolment_lookback_years: config.enrolment_lookback_years,
            new_enrolments_window_hours: config.new_enrolments_window_hours,
            row_concurrency: config.row_concurrency,
        }
    }
}

/// The stages and the collaborators they share.
pub struct Pipeline {
    store: Arc<dyn ReconcileStore>,
    offsets: Arc<dyn OffsetStore>,
    source: Arc<dyn UpstreamSource>,
    scorer: Arc<dyn NameSimilarity>,
    writer: BulkWriter,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        offsets: Arc<dyn OffsetStore>,
        source: Arc<dyn UpstreamSource>,
        scorer: Arc<dyn NameSimilarity>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            writer: BulkWriter::new(settings.row_concurrency),
            store,
            offsets,
            source,
            scorer,
            settings,
        }
    }

    pub fn offsets(&self) -> &dyn OffsetStore {
        self.offsets.as_ref()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run_stage(&self, stage: Stage, ctx: &RunContext) -> Result<StageReport, StageError> {
        info!(run_id = %ctx.run_id, stage = %stage, "Stage started");

        let report = match stage {
            Stage::Persons => self.sync_persons().await?,
            Stage::Organisations => self.sync_organisations().await?,
            Stage::Courses => self.sync_courses(ctx).await?,
            Stage::Enrolments => self.sync_enrolments(ctx).await?,
            Stage::Counts => self.update_counts().await?,
            Stage::Interim => self.sync_interim_targets().await?,
        };

        if !report.skipped.is_empty() {
            warn!(run_id = %ctx.run_id, stage = %stage, skipped = report.skipped.len(), "Stage skipped rows");
        }
        info!(run_id = %ctx.run_id, stage = %stage, deleted = report.deleted, "Stage finished");
        Ok(report)
    }

    /// Delete cancelled realisations that have not received feedback.
    pub async fn purge_cancelled_realisations(&self, realisation_ids: &[String]) -> StoreResult<CleanupReport> {
        delete_cancelled_realisations(self.store.as_ref(), realisation_ids).await
    }

    async fn drain<T, H>(&self, spec: &StreamSpec, handler: &mut H) -> Result<FetchStats, FetchError>
    where
        T: DeserializeOwned + Send + 'static,
        H: PageHandler<T>,
    {
        BatchFetcher::new(self.source.as_ref(), self.offsets.as_ref())
            .drain(spec, handler)
            .await
    }

    /// Merge `rows`, collecting the rows the fallback path skipped.
    async fn merge<E>(&self, rows: Vec<E>, policy: ConflictPolicy, skipped: &mut Vec<SkippedRow>) -> StoreResult<Vec<E>>
    where
        E: Entity,
        dyn ReconcileStore: MergeTarget<E>,
    {
        let outcome = self.writer.merge(self.store.as_ref(), rows, policy).await?;
        skipped.extend(outcome.skipped);
        Ok(outcome.written)
    }
}
