//! Teacher assignments and study groups of realisations

use crate::models::{AccessStatus, Group, UserFeedbackTarget};
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::RealisationRecord;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

const ADMINISTRATIVE_PERSON_URNS: [&str; 2] = [
    "urn:code:course-unit-realisation-responsibility-info-type:administrative-person",
    "urn:code:module-responsibility-info-type:administrative-person",
];

const RESPONSIBLE_TEACHER_URNS: [&str; 4] = [
    "urn:code:course-unit-realisation-responsibility-info-type:responsible-teacher",
    "urn:code:course-unit-realisation-responsibility-info-type:contact-info",
    "urn:code:module-responsibility-info-type:responsible-teacher",
    "urn:code:module-responsibility-info-type:contact-info",
];

pub const TEACHER_ASSIGNMENT_UPDATE: ConflictPolicy =
    ConflictPolicy::Update(&["group_ids", "access_status", "is_administrative_person"]);

pub const GROUP_UPDATE: ConflictPolicy = ConflictPolicy::Update(&["name"]);

/// Every teacher of a realisation starting before this is responsible.
fn responsible_for_all_before() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2023, 1, 1)
}

pub fn is_administrative(role_urn: Option<&str>) -> bool {
    role_urn.is_some_and(|urn| ADMINISTRATIVE_PERSON_URNS.contains(&urn))
}

pub fn access_status(role_urn: Option<&str>, realisation_start: Option<NaiveDate>) -> AccessStatus {
    let legacy = realisation_start
        .zip(responsible_for_all_before())
        .is_some_and(|(start, cutoff)| start < cutoff);

    let responsible = role_urn.is_some_and(|urn| RESPONSIBLE_TEACHER_URNS.contains(&urn)) || is_administrative(role_urn);

    if legacy || responsible {
        AccessStatus::ResponsibleTeacher
    } else {
        AccessStatus::Teacher
    }
}

/// Keep one assignment per (user, target): responsible before plain, and
/// among equals a non-administrative one first. Ties keep input order.
pub fn prioritize_and_dedup(mut assignments: Vec<UserFeedbackTarget>) -> Vec<UserFeedbackTarget> {
    assignments.sort_by_key(|a| (a.access_status != AccessStatus::ResponsibleTeacher, a.is_administrative_person));

    let mut seen = HashSet::new();
    assignments.retain(|a| seen.insert((a.user_id.clone(), a.feedback_target_id)));
    assignments
}

/// Study groups of a stored target and the sub group ids of each teacher.
///
/// Only sets split into more than one sub group produce groups.
pub fn study_groups(feedback_target_id: i32, record: &RealisationRecord) -> (Vec<Group>, HashMap<String, Vec<String>>) {
    let mut groups = Vec::new();
    let mut by_teacher: HashMap<String, Vec<String>> = HashMap::new();

    for set in record.study_group_sets.iter().filter(|s| s.study_sub_groups.len() > 1) {
        for sub_group in &set.study_sub_groups {
            groups.push(Group {
                id: sub_group.id.clone(),
                feedback_target_id,
                name: sub_group.name.clone(),
            });
            for teacher in sub_group.teacher_ids.iter().flatten() {
                by_teacher
                    .entry(teacher.clone())
                    .or_default()
                    .push(sub_group.id.clone());
            }
        }
    }

    (groups, by_teacher)
}

/// Teacher assignments of one stored target, before tie-break.
pub fn teacher_assignments(
    feedback_target_id: i32,
    record: &RealisationRecord,
    groups_by_teacher: &HashMap<String, Vec<String>>,
) -> Vec<UserFeedbackTarget> {
    record
        .responsibility_infos
        .iter()
        .filter_map(|info| {
            let user_id = info.person_id.as_ref()?;
            let role = info.role_urn.as_deref();
            Some(UserFeedbackTarget {
                id: None,
                user_id: user_id.clone(),
                feedback_target_id,
                access_status: access_status(role, record.activity_period.start_date),
                is_administrative_person: is_administrative(role),
                group_ids: groups_by_teacher.get(user_id).cloned(),
                user_created: false,
            })
        })
        .collect()
}
