//! Stage 1: persons

use super::{Pipeline, StageError, StageReport};
use crate::db::StoreError;
use crate::updater::bulk::SkippedRow;
use crate::updater::fetcher::{PageHandler, StreamSpec};
use crate::updater::importer::records::PersonRecord;
use crate::updater::reconcile::persons::{to_user, USER_UPDATE};
use async_trait::async_trait;

pub const PERSONS_STREAM: &str = "persons";

struct PersonsPage<'a> {
    pipeline: &'a Pipeline,
    skipped: Vec<SkippedRow>,
}

#[async_trait]
impl<'a> PageHandler<PersonRecord> for PersonsPage<'a> {
    type Error = StoreError;

    async fn handle(&mut self, page: Vec<PersonRecord>) -> Result<(), StoreError> {
        let users = page.iter().map(to_user).collect();
        self.pipeline
            .merge(users, USER_UPDATE, &mut self.skipped)
            .await?;
        Ok(())
    }
}

impl Pipeline {
    pub(super) async fn sync_persons(&self) -> Result<StageReport, StageError> {
        let spec = StreamSpec::new(PERSONS_STREAM, self.settings.persons_page_size);
        let mut handler = PersonsPage {
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
