//! Interim feedback membership
//!
//! Teachers may create extra "interim" feedback targets next to the
//! generated one of a realisation. Their membership follows the generated
//! target, one access status at a time: members gone from the generated
//! target are removed, new ones are added as user created.

use crate::models::{AccessStatus, UserFeedbackTarget};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InterimPlan {
    pub remove: Vec<i64>,
    pub add: Vec<UserFeedbackTarget>,
}

impl InterimPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Changes that make `interim_members` of `interim_target_id` follow
/// `original_members`. Statuses absent from the original are left alone.
pub fn plan_interim_sync(
    original_members: &[UserFeedbackTarget],
    interim_target_id: i32,
    interim_members: &[UserFeedbackTarget],
) -> InterimPlan {
    let mut by_status: BTreeMap<AccessStatus, Vec<&UserFeedbackTarget>> = BTreeMap::new();
    for member in original_members {
        by_status.entry(member.access_status).or_default().push(member);
    }

    let mut plan = InterimPlan::default();

    for (status, members) in by_status {
        let wanted: HashSet<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
        let present: Vec<&UserFeedbackTarget> = interim_members
            .iter()
            .filter(|m| m.access_status == status)
            .collect();

        plan.remove.extend(
            present
                .iter()
                .filter(|m| !wanted.contains(m.user_id.as_str()))
                .filter_map(|m| m.id),
        );

        let existing: HashSet<&str> = present.iter().map(|m| m.user_id.as_str()).collect();
        let mut added = HashSet::new();
        plan.add.extend(
            members
                .into_iter()
                .filter(|m| !existing.contains(m.user_id.as_str()) && added.insert(m.user_id.as_str()))
                .map(|m| UserFeedbackTarget {
                    id: None,
                    user_id: m.user_id.clone(),
                    feedback_target_id: interim_target_id,
                    access_status: status,
                    is_administrative_person: m.is_administrative_person,
                    group_ids: None,
                    user_created: true,
                }),
        );
    }

    plan
}
