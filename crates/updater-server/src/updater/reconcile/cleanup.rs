//! Cancelled-realisation cleanup
//!
//! A cancelled realisation is deleted together with everything hanging off
//! it, but only while none of its feedback targets has received feedback.
//! The check and the deletes run as one unit in the store.

use crate::db::StoreResult;
use crate::store::ReconcileStore;
use serde::Serialize;
use std::fmt;
use tracing::info;

/// One delete of the cascade. [`CascadeStep::ORDER`] respects the
/// foreign keys between the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStep {
    /// Teacher and student user feedback targets
    Assignments,
    Logs,
    Surveys,
    FeedbackTargets,
    Groups,
    OrganisationLinks,
    TagLinks,
    Realisations,
}

impl CascadeStep {
    pub const ORDER: [CascadeStep; 8] = [
        CascadeStep::Assignments,
        CascadeStep::Logs,
        CascadeStep::Surveys,
        CascadeStep::FeedbackTargets,
        CascadeStep::Groups,
        CascadeStep::OrganisationLinks,
        CascadeStep::TagLinks,
        CascadeStep::Realisations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeStep::Assignments => "user_feedback_targets",
            CascadeStep::Logs => "feedback_target_logs",
            CascadeStep::Surveys => "surveys",
            CascadeStep::FeedbackTargets => "feedback_targets",
            CascadeStep::Groups => "groups",
            CascadeStep::OrganisationLinks => "course_realisations_organisations",
            CascadeStep::TagLinks => "course_realisations_tags",
            CascadeStep::Realisations => "course_realisations",
        }
    }
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted_realisations: Vec<String>,
    /// Ids that stayed because feedback was given, or that were never stored
    pub kept: Vec<String>,
    pub rows_deleted: Vec<(CascadeStep, u64)>,
}

pub async fn delete_cancelled_realisations(
    store: &dyn ReconcileStore,
    cancelled: &[String],
) -> StoreResult<CleanupReport> {
    if cancelled.is_empty() {
        return Ok(CleanupReport::default());
    }

    let mut report = store.delete_realisations_without_feedback(cancelled).await?;
    report.kept = cancelled
        .iter()
        .filter(|id| !report.deleted_realisations.contains(id))
        .cloned()
        .collect();

    for (step, rows) in &report.rows_deleted {
        info!(step = %step, rows, "Deleted rows of cancelled realisations");
    }
    if !report.deleted_realisations.is_empty() {
        info!(
            realisations = report.deleted_realisations.len(),
            kept = report.kept.len(),
            "Cancelled realisations deleted"
        );
    }
    Ok(report)
}
