//! Stage 3: course units, realisations and teacher assignments
//!
//! Three passes over the same stream, each with its own offset. Open
//! university units can only be matched once every formal unit is stored,
//! and realisations need both.

use super::{Pipeline, RunContext, StageError, StageReport};
use crate::db::StoreError;
use crate::models::FeedbackTarget;
use crate::updater::bulk::{ConflictPolicy, SkippedRow};
use crate::updater::fetcher::{PageHandler, StreamSpec};
use crate::updater::importer::records::{CourseUnitRecord, RealisationRecord};
use crate::updater::reconcile::cleanup::delete_cancelled_realisations;
use crate::updater::reconcile::course_units::{
    formal_organisation_links, is_formal_code, is_matchable_open_code, open_unit_organisation_links,
    to_course_units, COURSE_UNIT_UPDATE,
};
use crate::updater::reconcile::realisations::{
    is_active, is_independent_work, organisation_links, to_feedback_target, to_inactive_realisation,
    to_realisation, FEEDBACK_TARGET_KEEP_DATES, FEEDBACK_TARGET_UPDATE, INACTIVE_REALISATION_UPDATE,
    REALISATION_UPDATE,
};
use crate::updater::reconcile::teachers::{
    prioritize_and_dedup, study_groups, teacher_assignments, GROUP_UPDATE, TEACHER_ASSIGNMENT_UPDATE,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub const COURSES_STREAM: &str = "course_unit_realisations_with_course_units";
pub const COURSE_UNITS_PASS: &str = "course-units";
pub const OPEN_COURSE_UNITS_PASS: &str = "open-course-units";
pub const REALISATIONS_PASS: &str = "realisations";

/// Distinct course units of a page matching `keep`.
fn page_course_units<'p>(
    page: &'p [RealisationRecord],
    keep: impl Fn(&CourseUnitRecord) -> bool,
) -> Vec<&'p CourseUnitRecord> {
    let mut seen = HashSet::new();
    page.iter()
        .flat_map(|r| &r.course_units)
        .filter(|cu| keep(cu) && seen.insert(cu.id.as_str()))
        .collect()
}

struct FormalUnitsPage<'a> {
    pipeline: &'a Pipeline,
    skipped: Vec<SkippedRow>,
}

#[async_trait]
impl<'a> PageHandler<RealisationRecord> for FormalUnitsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<RealisationRecord>) -> Result<(), StoreError> {
        let units = page_course_units(&page, |cu| is_formal_code(&cu.code));

        self.pipeline
            .merge(to_course_units(units.iter().copied()), COURSE_UNIT_UPDATE, &mut self.skipped)
            .await?;
        self.pipeline
            .merge(formal_organisation_links(units), ConflictPolicy::Ignore, &mut self.skipped)
            .await?;

        Ok(())
    }
}

struct OpenUnitsPage<'a> {
    pipeline: &'a Pipeline,
    skipped: Vec<SkippedRow>,
}

#[async_trait]
impl<'a> PageHandler<RealisationRecord> for OpenUnitsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<RealisationRecord>) -> Result<(), StoreError> {
        let units = page_course_units(&page, |cu| is_matchable_open_code(&cu.code));
        if units.is_empty() {
            return Ok(());
        }

        self.pipeline
            .merge(to_course_units(units.iter().copied()), COURSE_UNIT_UPDATE, &mut self.skipped)
            .await?;

        let links =
            open_unit_organisation_links(self.pipeline.store.as_ref(), self.pipeline.scorer.as_ref(), &units).await?;
        self.pipeline
            .merge(links, ConflictPolicy::Ignore, &mut self.skipped)
            .await?;

        Ok(())
    }
}

struct RealisationsPage<'a> {
    pipeline: &'a Pipeline,
    manually_enabled: HashSet<String>,
    skipped: Vec<SkippedRow>,
    deleted: u64,
}

impl RealisationsPage<'_> {
    /// Generated targets of `active`, stored. Targets of unknown course
    /// units are left out; targets with teacher-edited dates keep them.
    async fn store_feedback_targets(&mut self, active: &[&RealisationRecord]) -> Result<Vec<FeedbackTarget>, StoreError> {
        let store = self.pipeline.store.as_ref();
        let mut targets: Vec<FeedbackTarget> = active
            .iter()
            .filter_map(|r| to_feedback_target(self.pipeline.scorer.as_ref(), r))
            .collect();

        let unit_ids: Vec<String> = targets.iter().map(|t| t.course_unit_id.clone()).collect();
        let known_units = store.existing_course_unit_ids(&unit_ids).await?;
        let before = targets.len();
        targets.retain(|t| known_units.contains(&t.course_unit_id));
        if targets.len() < before {
            debug!(dropped = before - targets.len(), "Feedback targets without a stored course unit");
        }

        let type_ids: Vec<String> = targets.iter().map(|t| t.type_id.clone()).collect();
        let edited = store.type_ids_with_edited_dates(&type_ids).await?;
        let (keep_dates, regular): (Vec<_>, Vec<_>) =
            targets.into_iter().partition(|t| edited.contains(&t.type_id));

        let mut stored = self
            .pipeline
            .merge(regular, FEEDBACK_TARGET_UPDATE, &mut self.skipped)
            .await?;
        stored.extend(
            self.pipeline
                .merge(keep_dates, FEEDBACK_TARGET_KEEP_DATES, &mut self.skipped)
                .await?,
        );
        Ok(stored)
    }
}

#[async_trait]
impl<'a> PageHandler<RealisationRecord> for RealisationsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<RealisationRecord>) -> Result<(), StoreError> {
        let active: Vec<&RealisationRecord> = page
            .iter()
            .filter(|r| is_active(r, &self.manually_enabled))
            .collect();

        self.pipeline
            .merge(
                active.iter().map(|r| to_realisation(r)).collect(),
                REALISATION_UPDATE,
                &mut self.skipped,
            )
            .await?;
        self.pipeline
            .merge(
                organisation_links(active.iter().copied()),
                ConflictPolicy::Ignore,
                &mut self.skipped,
            )
            .await?;

        let targets = self.store_feedback_targets(&active).await?;
        let target_ids: HashMap<&str, i32> = targets
            .iter()
            .filter_map(|t| t.id.map(|id| (t.course_realisation_id.as_str(), id)))
            .collect();

        let mut groups = Vec::new();
        let mut assignments = Vec::new();
        for record in &active {
            let Some(&target_id) = target_ids.get(record.id.as_str()) else {
                continue;
            };
            let (record_groups, groups_by_teacher) = study_groups(target_id, record);
            assignments.extend(teacher_assignments(target_id, record, &groups_by_teacher));
            groups.extend(record_groups);
        }

        self.pipeline
            .merge(groups, GROUP_UPDATE, &mut self.skipped)
            .await?;
        self.pipeline
            .merge(
                prioritize_and_dedup(assignments),
                TEACHER_ASSIGNMENT_UPDATE,
                &mut self.skipped,
            )
            .await?;

        let cancelled: Vec<String> = page
            .iter()
            .filter(|r| r.is_cancelled())
            .map(|r| r.id.clone())
            .collect();
        let cleanup = delete_cancelled_realisations(self.pipeline.store.as_ref(), &cancelled).await?;
        self.deleted += cleanup.deleted_realisations.len() as u64;

        let independent = page
            .iter()
            .filter(|r| is_independent_work(r))
            .map(to_inactive_realisation)
            .collect();
        self.pipeline
            .merge(independent, INACTIVE_REALISATION_UPDATE, &mut self.skipped)
            .await?;

        Ok(())
    }
}

impl Pipeline {
    pub(super) async fn sync_courses(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        let page_size = self.settings.courses_page_size;
        let mut report = StageReport::default();

        let spec = StreamSpec::new(COURSES_STREAM, page_size).pass(COURSE_UNITS_PASS);
        let mut formal = FormalUnitsPage {
            pipeline: self,
            skipped: Vec::new(),
        };
        let stats = self.drain(&spec, &mut formal).await?;
        report.stream(&spec, stats);
        report.skipped.extend(formal.skipped);

        let spec = StreamSpec::new(COURSES_STREAM, page_size).pass(OPEN_COURSE_UNITS_PASS);
        let mut open = OpenUnitsPage {
            pipeline: self,
            skipped: Vec::new(),
        };
        let stats = self.drain(&spec, &mut open).await?;
        report.stream(&spec, stats);
        report.skipped.extend(open.skipped);

        let spec = StreamSpec::new(COURSES_STREAM, page_size).pass(REALISATIONS_PASS);
        report.deleted += self.reset_teacher_rights(ctx, &spec).await?;

        let mut realisations = RealisationsPage {
            pipeline: self,
            manually_enabled: self.store.manually_enabled_realisation_ids().await?,
            skipped: Vec::new(),
            deleted: 0,
        };
        let stats = self.drain(&spec, &mut realisations).await?;
        report.stream(&spec, stats);
        report.skipped.extend(realisations.skipped);
        report.deleted += realisations.deleted;

        Ok(report)
    }

    /// On Sundays teacher rights are rebuilt from scratch by the realisation
    /// pass. A pass that already made progress is not reset again.
    async fn reset_teacher_rights(&self, ctx: &RunContext, spec: &StreamSpec) -> Result<u64, StageError> {
        if !ctx.starts_on_sunday() || self.offsets.get(&spec.offset_key()).await?.is_some() {
            return Ok(0);
        }

        let deleted = self.store.delete_teacher_rights_without_feedback().await?;
        info!(run_id = %ctx.run_id, deleted, "Weekly reset of teacher rights");
        Ok(deleted)
    }
}
