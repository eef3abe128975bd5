//! Stages 5 and 6: derived counts and interim feedback membership

use super::{Pipeline, StageError, StageReport};
use crate::updater::bulk::ConflictPolicy;
use crate::updater::reconcile::interim::plan_interim_sync;
use tracing::{debug, info};

impl Pipeline {
    pub(super) async fn update_counts(&self) -> Result<StageReport, StageError> {
        let updated = self.store.update_hidden_counts().await?;
        info!(targets = updated, "Hidden feedback counts updated");

        Ok(StageReport {
            updated,
            ..Default::default()
        })
    }

    pub(super) async fn sync_interim_targets(&self) -> Result<StageReport, StageError> {
        let store = self.store.as_ref();
        let mut report = StageReport::default();
        let mut added = 0usize;

        for set in store.interim_target_sets().await? {
            let original = store.user_feedback_targets_of(set.original_target_id).await?;

            for interim_id in set.interim_target_ids {
                let members = store.user_feedback_targets_of(interim_id).await?;
                let plan = plan_interim_sync(&original, interim_id, &members);
                if plan.is_empty() {
                    continue;
                }

                debug!(
                    realisation_id = %set.course_realisation_id,
                    interim_target_id = interim_id,
                    remove = plan.remove.len(),
                    add = plan.add.len(),
                    "Syncing interim target"
                );

                if !plan.remove.is_empty() {
                    report.deleted += store.delete_user_feedback_targets(&plan.remove).await?;
                }
                added += self
                    .merge(plan.add, ConflictPolicy::Ignore, &mut report.skipped)
                    .await?
                    .len();
            }
        }

        info!(added, removed = report.deleted, "Interim targets synced");
        Ok(report)
    }
}
