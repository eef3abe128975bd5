//! Storage seam of the reconciliation pipeline
//!
//! Everything a stage reads or writes goes through [`ReconcileStore`]:
//! merges through the per-entity [`MergeTarget`] supertraits, the handful of
//! lookups and deletions through the methods below. [`PgStore`] is the
//! production adapter.

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

use crate::db::StoreResult;
use crate::models::{
    CourseRealisation, CourseRealisationOrganisation, CourseUnit, CourseUnitOrganisation,
    FeedbackTarget, FeedbackTargetRef, Group, InactiveCourseRealisation, InterimTargetSet,
    Organisation, User, UserFeedbackTarget,
};
use crate::updater::bulk::MergeTarget;
use crate::updater::reconcile::cleanup::CleanupReport;
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait ReconcileStore:
    MergeTarget<User>
    + MergeTarget<Organisation>
    + MergeTarget<CourseUnit>
    + MergeTarget<CourseUnitOrganisation>
    + MergeTarget<CourseRealisation>
    + MergeTarget<CourseRealisationOrganisation>
    + MergeTarget<InactiveCourseRealisation>
    + MergeTarget<FeedbackTarget>
    + MergeTarget<UserFeedbackTarget>
    + MergeTarget<Group>
    + Send
    + Sync
{
    // ------------------------------------------------------------------
    // Course units
    // ------------------------------------------------------------------

    async fn course_unit_by_code(&self, code: &str) -> StoreResult<Option<CourseUnit>>;

    /// Formal course units whose code starts with `prefix`, case-insensitively.
    async fn course_units_by_code_prefix(&self, prefix: &str) -> StoreResult<Vec<CourseUnit>>;

    /// Organisation of the PRIMARY link of a course unit.
    async fn primary_organisation_of(&self, course_unit_id: &str) -> StoreResult<Option<String>>;

    async fn existing_course_unit_ids(&self, ids: &[String]) -> StoreResult<HashSet<String>>;

    // ------------------------------------------------------------------
    // Realisations and feedback targets
    // ------------------------------------------------------------------

    /// Inactive realisations an administrator switched on.
    async fn manually_enabled_realisation_ids(&self) -> StoreResult<HashSet<String>>;

    /// Type ids, among `type_ids`, of targets whose dates a teacher edited.
    async fn type_ids_with_edited_dates(&self, type_ids: &[String]) -> StoreResult<HashSet<String>>;

    async fn feedback_targets_of_realisations(
        &self,
        realisation_ids: &[String],
    ) -> StoreResult<Vec<FeedbackTargetRef>>;

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    /// Drop teacher assignments that carry no feedback.
    async fn delete_teacher_rights_without_feedback(&self) -> StoreResult<u64>;

    /// Drop STUDENT assignments for `(user_id, feedback_target_id)` pairs that
    /// are not user created, had no open e-mail sent and carry no feedback.
    async fn delete_student_assignments(&self, pairs: &[(String, i32)]) -> StoreResult<u64>;

    async fn user_feedback_targets_of(&self, feedback_target_id: i32) -> StoreResult<Vec<UserFeedbackTarget>>;

    async fn delete_user_feedback_targets(&self, ids: &[i64]) -> StoreResult<u64>;

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Delete the stored realisations among `ids` none of whose targets has
    /// feedback, running every
    /// [`CascadeStep`](crate::updater::reconcile::cleanup::CascadeStep) in order. The feedback check
    /// and the deletes commit or roll back together. `kept` is left empty.
    async fn delete_realisations_without_feedback(&self, ids: &[String]) -> StoreResult<CleanupReport>;

    // ------------------------------------------------------------------
    // Derived data
    // ------------------------------------------------------------------

    /// Recount hidden answers of every target, zero included. Returns the
    /// number of targets whose count changed.
    async fn update_hidden_counts(&self) -> StoreResult<u64>;

    /// Realisations with user-created interim targets next to their
    /// generated one.
    async fn interim_target_sets(&self) -> StoreResult<Vec<InterimTargetSet>>;
}
