//! Stage 4: student enrolments
//!
//! Withdrawals are applied before enrolments so a student who withdrew and
//! re-enrolled inside the window ends up enrolled.

use super::{Pipeline, RunContext, StageError, StageReport, StreamReport};
use crate::db::StoreError;
use crate::updater::bulk::SkippedRow;
use crate::updater::fetcher::{FetchStats, PageHandler, StreamSpec};
use crate::updater::importer::records::EnrolmentRecord;
use crate::updater::importer::{fetch_ready, PageRequest};
use crate::updater::reconcile::enrolments::{
    realisation_ids, student_assignments, withdrawn_pairs, STUDENT_ASSIGNMENT_UPDATE,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use tracing::info;

pub const DELETED_ENROLMENTS_STREAM: &str = "deleted-enrolments";
pub const ENROLMENTS_STREAM: &str = "enrolments";
pub const NEW_ENROLMENTS_PATH: &str = "enrolments-new";

struct DeletedEnrolmentsPage<'a> {
    pipeline: &'a Pipeline,
    deleted: u64,
}

#[async_trait]
impl<'a> PageHandler<EnrolmentRecord> for DeletedEnrolmentsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<EnrolmentRecord>) -> Result<(), StoreError> {
        let store = self.pipeline.store.as_ref();
        let targets = store
            .feedback_targets_of_realisations(&realisation_ids(&page))
            .await?;

        let pairs = withdrawn_pairs(&page, &targets);
        if !pairs.is_empty() {
            self.deleted += store.delete_student_assignments(&pairs).await?;
        }
        Ok(())
    }
}

struct EnrolmentsPage<'a> {
    pipeline: &'a Pipeline,
    skipped: Vec<SkippedRow>,
}

#[async_trait]
impl<'a> PageHandler<EnrolmentRecord> for EnrolmentsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<EnrolmentRecord>) -> Result<(), StoreError> {
        let targets = self
            .pipeline
            .store
            .feedback_targets_of_realisations(&realisation_ids(&page))
            .await?;

        let rows = student_assignments(&page, &targets);
        self.pipeline
            .merge(rows, STUDENT_ASSIGNMENT_UPDATE, &mut self.skipped)
            .await?;
        Ok(())
    }
}

/// `at` moved back by whole years. A window reaching past the earliest
/// representable instant starts from that instant.
fn years_before(at: DateTime<Utc>, years: u32) -> DateTime<Utc> {
    years
        .checked_mul(12)
        .and_then(|months| at.checked_sub_months(Months::new(months)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Pipeline {
    pub(super) async fn sync_enrolments(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        let since = years_before(ctx.started_at, self.settings.enrolment_lookback_years);
        let mut report = StageReport::default();

        let deleted_spec = StreamSpec::new(DELETED_ENROLMENTS_STREAM, self.settings.enrolments_page_size).since(since);
        let mut deleted = DeletedEnrolmentsPage {
            pipeline: self,
            deleted: 0,
        };
        let stats = self.drain(&deleted_spec, &mut deleted).await?;
        report.stream(&deleted_spec, stats);
        report.deleted = deleted.deleted;

        let spec = StreamSpec::new(ENROLMENTS_STREAM, self.settings.enrolments_page_size).since(since);
        let mut enrolments = EnrolmentsPage {
            pipeline: self,
            skipped: Vec::new(),
        };
        let stats = self.drain(&spec, &mut enrolments).await?;
        report.stream(&spec, stats);
        report.skipped = enrolments.skipped;

        Ok(report)
    }

    /// Refresh the students of one realisation.
    pub async fn update_enrolments_of_realisation(&self, realisation_id: &str) -> Result<StageReport, StageError> {
        let request = PageRequest::whole(format!("{ENROLMENTS_STREAM}/{realisation_id}"));
        let report = self.apply_enrolments(request).await?;

        info!(
            realisation_id = %realisation_id,
            records = report.streams[0].stats.records,
            "Realisation enrolments updated"
        );
        Ok(report)
    }

    /// Apply enrolments created within the configured recent window.
    pub async fn update_new_enrolments(&self) -> Result<StageReport, StageError> {
        let since = Utc::now() - Duration::hours(i64::from(self.settings.new_enrolments_window_hours));
        let request = PageRequest::whole(NEW_ENROLMENTS_PATH).with_since(since);
        let report = self.apply_enrolments(request).await?;

        info!(records = report.streams[0].stats.records, "New enrolments updated");
        Ok(report)
    }

    /// One unpaged request through the enrolments handler.
    async fn apply_enrolments(&self, request: PageRequest) -> Result<StageReport, StageError> {
        let fetched = fetch_ready::<EnrolmentRecord>(self.source.as_ref(), &request).await?;
        let stats = FetchStats {
            pages: 1,
            records: fetched.records.len() as u64,
            waits: fetched.waits,
            resumed_from: None,
        };

        let mut handler = EnrolmentsPage {
            pipeline: self,
            skipped: Vec::new(),
        };
        if !fetched.records.is_empty() {
            handler.handle(fetched.records).await?;
        }

        Ok(StageReport {
            streams: vec![StreamReport {
                key: request.path,
                stats,
            }],
            skipped: handler.skipped,
            ..Default::default()
        })
    }
}
