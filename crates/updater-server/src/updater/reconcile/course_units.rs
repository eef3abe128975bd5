//! Course units, their organisation links and open-university matching
//!
//! Open-university units carry an `AY` prefix in front of (roughly) the
//! code of the formal unit they are taught after. They are matched to that
//! formal unit to inherit its primary organisation, and realisations are
//! matched to the best of their course units with [`rank_candidates`].

use crate::db::StoreResult;
use crate::models::{CourseUnit, CourseUnitOrganisation, LinkType, LocalizedText};
use crate::store::ReconcileStore;
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::{CourseUnitRecord, OrganisationShare};
use crate::updater::reconcile::similarity::{localized_similarity, NameSimilarity};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};

const OPEN_UNIVERSITY_PREFIX: &str = "AY";

pub const COURSE_UNIT_UPDATE: ConflictPolicy = ConflictPolicy::Update(&["name", "course_code", "validity_period"]);

/// Formal units: not open university and not a bare number.
pub fn is_formal_code(code: &str) -> bool {
    !code.starts_with(OPEN_UNIVERSITY_PREFIX) && !is_all_digits(code)
}

/// Open-university units other than the bare `AY<digits>` codes.
pub fn is_matchable_open_code(code: &str) -> bool {
    code.strip_prefix(OPEN_UNIVERSITY_PREFIX)
        .is_some_and(|rest| !is_all_digits(rest))
}

pub fn strip_open_prefix(code: &str) -> &str {
    code.strip_prefix(OPEN_UNIVERSITY_PREFIX).unwrap_or(code)
}

/// Letters in front of the numeric part of a code, `TKT` for `TKT20005`.
/// `None` when the code has no numeric part or nothing in front of it.
pub fn letter_prefix(code: &str) -> Option<&str> {
    let end = code.find(|c: char| c.is_ascii_digit() || c == '.')?;
    let prefix = &code[..end];
    (!prefix.is_empty()).then_some(prefix)
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Course units of a page, first occurrence of each id wins.
pub fn to_course_units<'a>(records: impl IntoIterator<Item = &'a CourseUnitRecord>) -> Vec<CourseUnit> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id.as_str()))
        .map(|r| CourseUnit {
            id: r.id.clone(),
            course_code: r.code.clone(),
            name: r.name.clone(),
            validity_period: r.validity_period.clone(),
        })
        .collect()
}

/// Organisations with a share, largest first, paired with their link type.
pub(crate) fn ranked_organisations<'a>(
    shares: &'a [OrganisationShare],
    keep: impl Fn(&OrganisationShare) -> bool,
) -> Vec<(&'a str, LinkType)> {
    let mut kept: Vec<&OrganisationShare> = shares
        .iter()
        .filter(|s| s.organisation_id.is_some() && keep(s))
        .collect();
    kept.sort_by(|a, b| b.share.partial_cmp(&a.share).unwrap_or(Ordering::Equal));

    kept.into_iter()
        .filter_map(|s| s.organisation_id.as_deref())
        .enumerate()
        .map(|(rank, org)| (org, LinkType::for_rank(rank)))
        .collect()
}

/// Links of formal units to every organisation with a non-zero share.
pub fn formal_organisation_links<'a>(
    records: impl IntoIterator<Item = &'a CourseUnitRecord>,
) -> Vec<CourseUnitOrganisation> {
    records
        .into_iter()
        .filter(|r| is_formal_code(&r.code))
        .flat_map(|r| {
            ranked_organisations(&r.organisations, |s| s.share != 0.0)
                .into_iter()
                .map(|(org, link_type)| CourseUnitOrganisation {
                    course_unit_id: r.id.clone(),
                    organisation_id: org.to_string(),
                    link_type,
                })
        })
        .collect()
}

/// Anything that can be matched against course units.
pub trait MatchSubject {
    fn name(&self) -> &LocalizedText;
    fn starts_on(&self) -> Option<NaiveDate>;
}

impl MatchSubject for CourseUnitRecord {
    fn name(&self) -> &LocalizedText {
        &self.name
    }

    fn starts_on(&self) -> Option<NaiveDate> {
        self.validity_period.start_date
    }
}

/// A course unit that can be picked for a subject.
pub trait MatchCandidate {
    fn name(&self) -> &LocalizedText;
    fn started_on(&self) -> Option<NaiveDate>;
}

impl MatchCandidate for CourseUnit {
    fn name(&self) -> &LocalizedText {
        &self.name
    }

    fn started_on(&self) -> Option<NaiveDate> {
        self.validity_period.start_date
    }
}

impl MatchCandidate for CourseUnitRecord {
    fn name(&self) -> &LocalizedText {
        &self.name
    }

    fn started_on(&self) -> Option<NaiveDate> {
        self.validity_period.start_date
    }
}

/// Pick the candidate for `subject`.
///
/// Only candidates that started on or before the subject are eligible; a
/// subject without a start date accepts everyone. Eligible candidates are
/// ordered by best per-language name similarity, then by latest start.
/// Without eligible candidates the first candidate is returned.
pub fn rank_candidates<'c, C: MatchCandidate>(
    scorer: &dyn NameSimilarity,
    subject: &dyn MatchSubject,
    candidates: &'c [C],
) -> Option<&'c C> {
    let subject_start = subject.starts_on();
    let mut eligible: Vec<(f64, Option<NaiveDate>, &C)> = candidates
        .iter()
        .filter(|c| match (subject_start, c.started_on()) {
            (None, _) => true,
            (Some(start), Some(started)) => started <= start,
            (Some(_), None) => false,
        })
        .map(|c| {
            (
                localized_similarity(scorer, subject.name(), c.name()),
                c.started_on(),
                c,
            )
        })
        .collect();

    eligible.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
    });

    eligible
        .first()
        .map(|(_, _, c)| *c)
        .or_else(|| candidates.first())
}

/// Formal course unit an open-university unit was derived from.
///
/// Tries the code without the `AY` prefix first, then every formal unit
/// sharing the letter prefix, ranked against the open unit.
pub async fn find_formal_counterpart(
    store: &dyn ReconcileStore,
    scorer: &dyn NameSimilarity,
    open_unit: &CourseUnitRecord,
) -> StoreResult<Option<CourseUnit>> {
    let stripped = strip_open_prefix(&open_unit.code);
    if let Some(exact) = store.course_unit_by_code(stripped).await? {
        return Ok(Some(exact));
    }

    let Some(prefix) = letter_prefix(stripped) else {
        debug!(code = %open_unit.code, "Open course code has no numeric part");
        return Ok(None);
    };

    let candidates = store.course_units_by_code_prefix(prefix).await?;
    Ok(rank_candidates(scorer, open_unit, &candidates).cloned())
}

/// PRIMARY links of open-university units.
///
/// The organisation is the primary one of the matched formal unit, or the
/// open unit's own first organisation when there is no usable match.
pub async fn open_unit_organisation_links(
    store: &dyn ReconcileStore,
    scorer: &dyn NameSimilarity,
    open_units: &[&CourseUnitRecord],
) -> StoreResult<Vec<CourseUnitOrganisation>> {
    let mut links = Vec::with_capacity(open_units.len());

    for unit in open_units {
        let inherited = match find_formal_counterpart(store, scorer, unit).await? {
            Some(formal) => {
                let primary = store.primary_organisation_of(&formal.id).await?;
                if primary.is_none() {
                    info!(open = %unit.code, formal = %formal.course_code, "Matched formal unit has no primary organisation");
                }
                primary
            },
            None => None,
        };

        let organisation = inherited.or_else(|| {
            unit.organisations
                .first()
                .and_then(|s| s.organisation_id.clone())
        });

        match organisation {
            Some(organisation_id) => links.push(CourseUnitOrganisation {
                course_unit_id: unit.id.clone(),
                organisation_id,
                link_type: LinkType::Primary,
            }),
            None => debug!(code = %unit.code, "Open course unit has no organisation"),
        }
    }

    Ok(links)
}
