use crate::models::Organisation;
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::OrganisationRecord;

/// Visibility settings and disabled course codes belong to the application.
pub const ORGANISATION_UPDATE: ConflictPolicy = ConflictPolicy::Update(&["name", "code", "parent_id"]);

pub fn to_organisation(record: &OrganisationRecord) -> Organisation {
    Organisation {
        id: record.id.clone(),
        code: record.code.clone(),
        name: record.name.clone(),
        parent_id: record.parent_id.clone(),
    }
}
