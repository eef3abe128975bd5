//! Stage 2: organisations

use super::{Pipeline, StageError, StageReport};
use crate::db::StoreError;
use crate::updater::bulk::SkippedRow;
use crate::updater::fetcher::{PageHandler, StreamSpec};
use crate::updater::importer::records::OrganisationRecord;
use crate::updater::reconcile::organisations::{to_organisation, ORGANISATION_UPDATE};
use async_trait::async_trait;

pub const ORGANISATIONS_STREAM: &str = "organisations";

struct OrganisationsPage<'a> {
    pipeline: &'a Pipeline,
    skipped: Vec<SkippedRow>,
}

#[async_trait]
impl<'a> PageHandler<OrganisationRecord> for OrganisationsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<OrganisationRecord>) -> Result<(), StoreError> {
        let organisations = page.iter().map(to_organisation).collect();
        self.pipeline
            .merge(organisations, ORGANISATION_UPDATE, &mut self.skipped)
            .await?;
        Ok(())
    }
}

impl Pipeline {
    pub(super) async fn sync_organisations(&self) -> Result<StageReport, StageError> {
        let spec = StreamSpec::new(ORGANISATIONS_STREAM, self.settings.organisations_page_size);
        let mut handler = OrganisationsPage {
            pipeline: self,
            skipped: Vec::new(),
        };

        let stats = self.drain(&spec, &mut handler).await?;

        let mut report = StageReport::default();
        report.stream(&spec, stats);
        report.skipped = handler.skipped;
        Ok(report)
    }
}
