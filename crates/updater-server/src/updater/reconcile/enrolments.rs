//! Enrolments to student assignments

use crate::models::{AccessStatus, FeedbackTargetRef, UserFeedbackTarget};
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::EnrolmentRecord;
use std::collections::{HashMap, HashSet};

pub const STUDENT_ASSIGNMENT_UPDATE: ConflictPolicy = ConflictPolicy::Update(&["group_ids"]);

/// Distinct realisations referenced by a page, in first-seen order.
pub fn realisation_ids(enrolments: &[EnrolmentRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    enrolments
        .iter()
        .filter(|e| seen.insert(e.course_unit_realisation_id.as_str()))
        .map(|e| e.course_unit_realisation_id.clone())
        .collect()
}

fn targets_by_realisation(targets: &[FeedbackTargetRef]) -> HashMap<&str, Vec<i32>> {
    let mut by_realisation: HashMap<&str, Vec<i32>> = HashMap::new();
    for target in targets {
        by_realisation
            .entry(target.course_realisation_id.as_str())
            .or_default()
            .push(target.id);
    }
    by_realisation
}

/// (user, target) pairs of every enrolment with a person, against every
/// target of its realisation.
fn pairs<'e>(
    enrolments: &'e [EnrolmentRecord],
    targets: &[FeedbackTargetRef],
) -> Vec<(&'e EnrolmentRecord, &'e str, i32)> {
    let by_realisation = targets_by_realisation(targets);
    let mut seen = HashSet::new();

    enrolments
        .iter()
        .filter_map(|e| e.person_id.as_deref().map(|person| (e, person)))
        .flat_map(|(e, person)| {
            by_realisation
                .get(e.course_unit_realisation_id.as_str())
                .into_iter()
                .flatten()
                .map(move |target| (e, person, *target))
        })
        .filter(|(_, person, target)| seen.insert((*person, *target)))
        .collect()
}

pub fn student_assignments(enrolments: &[EnrolmentRecord], targets: &[FeedbackTargetRef]) -> Vec<UserFeedbackTarget> {
    pairs(enrolments, targets)
        .into_iter()
        .map(|(enrolment, person, target)| UserFeedbackTarget {
            id: None,
            user_id: person.to_string(),
            feedback_target_id: target,
            access_status: AccessStatus::Student,
            is_administrative_person: false,
            group_ids: (!enrolment.confirmed_study_sub_group_ids.is_empty())
                .then(|| enrolment.confirmed_study_sub_group_ids.clone()),
            user_created: false,
        })
        .collect()
}

/// Student assignments a withdrawn enrolment may remove.
pub fn withdrawn_pairs(enrolments: &[EnrolmentRecord], targets: &[FeedbackTargetRef]) -> Vec<(String, i32)> {
    pairs(enrolments, targets)
        .into_iter()
        .map(|(_, person, target)| (person.to_string(), target))
        .collect()
}
