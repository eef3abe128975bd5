//! Realisations, their organisation links and feedback targets
//!
//! Upstream activity periods are calendar dates with an exclusive end. They
//! are pinned to Europe/Helsinki wall-clock times before storage:
//!
//! | value                 | stored as                               |
//! |-----------------------|-----------------------------------------|
//! | realisation start     | start date 00:00                        |
//! | realisation end       | day before end date 23:59               |
//! | feedback opens        | end date 00:00                          |
//! | feedback closes       | end date + 14 days 23:59:59             |

use crate::models::{
    common_feedback_name, CourseRealisation, CourseRealisationOrganisation, FeedbackTarget,
    InactiveCourseRealisation, LocalizedText, FEEDBACK_TYPE_COURSE_REALISATION,
};
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::{OrganisationShare, RealisationRecord};
use crate::updater::reconcile::course_units::{rank_candidates, ranked_organisations, MatchSubject};
use crate::updater::reconcile::similarity::NameSimilarity;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::Helsinki;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

pub const VALID_REALISATION_TYPES: [&str; 7] = [
    "urn:code:course-unit-realisation-type:teaching-participation-lab",
    "urn:code:course-unit-realisation-type:teaching-participation-online",
    "urn:code:course-unit-realisation-type:teaching-participation-field-course",
    "urn:code:course-unit-realisation-type:teaching-participation-project",
    "urn:code:course-unit-realisation-type:teaching-participation-lectures",
    "urn:code:course-unit-realisation-type:teaching-participation-small-group",
    "urn:code:course-unit-realisation-type:teaching-participation-seminar",
];

pub const INDEPENDENT_WORK_TYPE: &str = "urn:code:course-unit-realisation-type:independent-work-project";

const COORDINATING_ORGANISATION_ROLE: &str = "urn:code:organisation-role:coordinating-organisation";
const OFFERING_CODES: &str = "urn:code:custom:hy-university-root-id:opintotarjonta";
const MOOC_CODE: &str = "urn:code:custom:hy-university-root-id:opintotarjonta:mooc";
const TEACHING_LANGUAGE_CODES: &str = "urn:code:custom:hy-university-root-id:opetuskielet";

const FEEDBACK_PERIOD_DAYS: u64 = 14;

pub const REALISATION_UPDATE: ConflictPolicy = ConflictPolicy::Update(&[
    "name",
    "start_date",
    "end_date",
    "educational_institution_urn",
    "is_mooc_course",
    "teaching_languages",
]);

/// `manually_enabled` is owned by administrators.
pub const INACTIVE_REALISATION_UPDATE: ConflictPolicy = REALISATION_UPDATE;

/// Refreshes the feedback period. Touching the key columns makes the
/// statement return stored rows, so ids come back for existing targets too.
pub const FEEDBACK_TARGET_UPDATE: ConflictPolicy =
    ConflictPolicy::Update(&["feedback_type", "type_id", "opens_at", "closes_at"]);

/// For targets whose feedback period a teacher changed.
pub const FEEDBACK_TARGET_KEEP_DATES: ConflictPolicy = ConflictPolicy::Update(&["feedback_type", "type_id"]);

/// Whether a realisation gets a feedback target.
pub fn is_active(record: &RealisationRecord, manually_enabled: &HashSet<String>) -> bool {
    manually_enabled.contains(&record.id)
        || (!record.course_units.is_empty()
            && record
                .course_unit_realisation_type_urn
                .as_deref()
                .is_some_and(|urn| VALID_REALISATION_TYPES.contains(&urn))
            && !record.is_cancelled())
}

/// Independent work is parked until an administrator enables it.
pub fn is_independent_work(record: &RealisationRecord) -> bool {
    !record.course_units.is_empty()
        && record.course_unit_realisation_type_urn.as_deref() == Some(INDEPENDENT_WORK_TYPE)
        && !record.is_cancelled()
}

fn helsinki(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    Helsinki
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

pub fn start_instant(start: Option<NaiveDate>) -> Option<DateTime<Utc>> {
    helsinki(start?, NaiveTime::MIN)
}

/// Last minute of the day before the exclusive end date.
pub fn end_instant(end: Option<NaiveDate>) -> Option<DateTime<Utc>> {
    let last_day = end?.checked_sub_days(Days::new(1))?;
    helsinki(last_day, NaiveTime::from_hms_opt(23, 59, 0)?)
}

pub fn feedback_opens_at(end: NaiveDate) -> Option<DateTime<Utc>> {
    helsinki(end, NaiveTime::MIN)
}

pub fn feedback_closes_at(end: NaiveDate) -> Option<DateTime<Utc>> {
    helsinki(end.checked_add_days(Days::new(FEEDBACK_PERIOD_DAYS))?, end_of_day())
}

fn educational_institution_urn(organisations: &[OrganisationShare]) -> Option<String> {
    let urns: BTreeSet<&str> = organisations
        .iter()
        .filter(|o| o.role_urn.as_deref() == Some(COORDINATING_ORGANISATION_ROLE))
        .filter_map(|o| o.educational_institution_urn.as_deref())
        .collect();
    if urns.len() > 1 {
        debug!(urns = ?urns, "Several coordinating institutions, using the first");
    }
    organisations
        .iter()
        .filter(|o| o.role_urn.as_deref() == Some(COORDINATING_ORGANISATION_ROLE))
        .find_map(|o| o.educational_institution_urn.clone())
}

fn is_mooc(record: &RealisationRecord) -> bool {
    record
        .custom_code_urns
        .as_ref()
        .and_then(|codes| codes.get(OFFERING_CODES))
        .is_some_and(|codes| codes.iter().any(|c| c == MOOC_CODE))
}

/// Two-letter codes from the teaching-language URNs.
fn teaching_languages(record: &RealisationRecord) -> Option<Vec<String>> {
    let urns = record.custom_code_urns.as_ref()?.get(TEACHING_LANGUAGE_CODES)?;
    let languages: Vec<String> = urns
        .iter()
        .map(|urn| {
            let split = urn
                .char_indices()
                .rev()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(0);
            urn[split..].to_string()
        })
        .collect();
    (!languages.is_empty()).then_some(languages)
}

pub fn to_realisation(record: &RealisationRecord) -> CourseRealisation {
    CourseRealisation {
        id: record.id.clone(),
        name: record.name.clone(),
        start_date: start_instant(record.activity_period.start_date),
        end_date: end_instant(record.activity_period.end_date),
        educational_institution_urn: educational_institution_urn(&record.organisations),
        is_mooc_course: is_mooc(record),
        teaching_languages: teaching_languages(record),
    }
}

pub fn to_inactive_realisation(record: &RealisationRecord) -> InactiveCourseRealisation {
    to_realisation(record).into()
}

pub fn organisation_links<'a>(
    records: impl IntoIterator<Item = &'a RealisationRecord>,
) -> Vec<CourseRealisationOrganisation> {
    records
        .into_iter()
        .flat_map(|r| {
            ranked_organisations(&r.organisations, |s| s.share > 0.0)
                .into_iter()
                .map(|(org, link_type)| CourseRealisationOrganisation {
                    course_realisation_id: r.id.clone(),
                    organisation_id: org.to_string(),
                    link_type,
                })
        })
        .collect()
}

impl MatchSubject for RealisationRecord {
    fn name(&self) -> &LocalizedText {
        &self.name
    }

    fn starts_on(&self) -> Option<NaiveDate> {
        self.activity_period.start_date
    }
}

/// Generated feedback target of a realisation, unsaved. `None` when the
/// realisation has no course unit or no end date to open feedback on.
pub fn to_feedback_target(scorer: &dyn NameSimilarity, record: &RealisationRecord) -> Option<FeedbackTarget> {
    let course_unit = rank_candidates(scorer, record, &record.course_units)?;
    let end = record.activity_period.end_date?;

    Some(FeedbackTarget {
        id: None,
        feedback_type: FEEDBACK_TYPE_COURSE_REALISATION.to_string(),
        type_id: record.id.clone(),
        course_unit_id: course_unit.id.clone(),
        course_realisation_id: record.id.clone(),
        name: common_feedback_name(),
        hidden: false,
        opens_at: feedback_opens_at(end),
        closes_at: feedback_closes_at(end),
    })
}
