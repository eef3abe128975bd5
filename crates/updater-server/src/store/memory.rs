//! In-process stores for tests
//!
//! [`MemoryStore`] follows the Postgres adapter where the pipeline can tell
//! the difference: batches are atomic, foreign keys are checked, conflict
//! policies update only the listed columns and a batch that updates the
//! same key twice is rejected.

use super::ReconcileStore;
use crate::db::{StoreError, StoreResult};
use crate::models::{
    AccessStatus, CourseRealisation, CourseRealisationOrganisation, CourseUnit, CourseUnitOrganisation,
    Entity, FeedbackTarget, FeedbackTargetRef, Group, InactiveCourseRealisation, InterimTargetSet,
    LinkType, LocalizedText, Organisation, RoleClass, User, UserFeedbackTarget, ValidityPeriod,
    FEEDBACK_TYPE_COURSE_REALISATION,
};
use crate::updater::bulk::{ConflictPolicy, MergeTarget};
use crate::updater::job_run::{JobRun, JobRunStore, JobStatus};
use crate::updater::offsets::OffsetStore;
use crate::updater::reconcile::cleanup::{CascadeStep, CleanupReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

type AssignmentKey = (String, i32, RoleClass);

/// Everything the pipeline owns, in comparable form.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Snapshot {
    pub users: BTreeMap<String, User>,
    pub organisations: BTreeMap<String, Organisation>,
    pub course_units: BTreeMap<String, CourseUnit>,
    pub course_unit_organisations: BTreeMap<(String, String), CourseUnitOrganisation>,
    pub realisations: BTreeMap<String, CourseRealisation>,
    pub realisation_organisations: BTreeMap<(String, String), CourseRealisationOrganisation>,
    pub inactive_realisations: BTreeMap<String, InactiveCourseRealisation>,
    pub feedback_targets: BTreeMap<(String, String), FeedbackTarget>,
    pub assignments: BTreeMap<AssignmentKey, UserFeedbackTarget>,
    pub groups: BTreeMap<String, Group>,
    pub hidden_counts: BTreeMap<i32, i64>,
    pub manually_enabled: BTreeSet<String>,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    data: Snapshot,
    next_target_id: i32,
    next_assignment_id: i64,
    /// Feedback answers by assignment
    feedback: HashMap<AssignmentKey, Value>,
    open_email_sent: HashSet<AssignmentKey>,
    dates_edited: HashSet<String>,
    user_created_targets: HashSet<i32>,
    user_created_realisations: HashSet<String>,
    surveys: Vec<i32>,
    logs: Vec<i32>,
    tags: Vec<String>,
}

impl Tables {
    fn target_exists(&self, id: i32) -> bool {
        self.data.feedback_targets.values().any(|t| t.id == Some(id))
    }

    fn target_ids(&self) -> impl Iterator<Item = (i32, &FeedbackTarget)> {
        self.data
            .feedback_targets
            .values()
            .filter_map(|t| t.id.map(|id| (id, t)))
    }
}

/// A row type [`MemoryStore`] can merge.
trait MemRecord: Entity + DeserializeOwned {
    type Key: Ord + Clone + std::fmt::Debug;

    fn key(&self) -> Self::Key;
    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self>;

    /// Foreign keys of the row.
    fn check(&self, _tables: &Tables) -> StoreResult<()> {
        Ok(())
    }

    /// Fill generated columns of a new row.
    fn on_insert(&mut self, _tables: &mut Tables) {}
}

fn fk(ok: bool, entity: &'static str, constraint: &str) -> StoreResult<()> {
    if ok {
        Ok(())
    } else {
        Err(StoreError::constraint(entity, constraint))
    }
}

impl MemRecord for User {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.users
    }
}

impl MemRecord for Organisation {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.organisations
    }
}

impl MemRecord for CourseUnit {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.course_units
    }
}

impl MemRecord for CourseUnitOrganisation {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.course_unit_id.clone(), self.organisation_id.clone())
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self> {
        &mut tables.data.course_unit_organisations
    }

    fn check(&self, tables: &Tables) -> StoreResult<()> {
        fk(
            tables.data.course_units.contains_key(&self.course_unit_id),
            Self::NAME,
            "course_units_organisations_course_unit_id_fkey",
        )?;
        fk(
            tables.data.organisations.contains_key(&self.organisation_id),
            Self::NAME,
            "course_units_organisations_organisation_id_fkey",
        )
    }
}

impl MemRecord for CourseRealisation {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.realisations
    }
}

impl MemRecord for InactiveCourseRealisation {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.inactive_realisations
    }
}

impl MemRecord for CourseRealisationOrganisation {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.course_realisation_id.clone(), self.organisation_id.clone())
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self> {
        &mut tables.data.realisation_organisations
    }

    fn check(&self, tables: &Tables) -> StoreResult<()> {
        fk(
            tables.data.realisations.contains_key(&self.course_realisation_id),
            Self::NAME,
            "course_realisations_organisations_course_realisation_id_fkey",
        )?;
        fk(
            tables.data.organisations.contains_key(&self.organisation_id),
            Self::NAME,
            "course_realisations_organisations_organisation_id_fkey",
        )
    }
}

impl MemRecord for FeedbackTarget {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.feedback_type.clone(), self.type_id.clone())
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self> {
        &mut tables.data.feedback_targets
    }

    fn check(&self, tables: &Tables) -> StoreResult<()> {
        fk(
            tables.data.course_units.contains_key(&self.course_unit_id),
            Self::NAME,
            "feedback_targets_course_unit_id_fkey",
        )?;
        fk(
            tables.data.realisations.contains_key(&self.course_realisation_id),
            Self::NAME,
            "feedback_targets_course_realisation_id_fkey",
        )
    }

    fn on_insert(&mut self, tables: &mut Tables) {
        tables.next_target_id += 1;
        self.id = Some(tables.next_target_id);
    }
}

impl MemRecord for UserFeedbackTarget {
    type Key = AssignmentKey;

    fn key(&self) -> Self::Key {
        (
            self.user_id.clone(),
            self.feedback_target_id,
            self.access_status.role_class(),
        )
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self> {
        &mut tables.data.assignments
    }

    fn check(&self, tables: &Tables) -> StoreResult<()> {
        fk(
            tables.data.users.contains_key(&self.user_id),
            Self::NAME,
            "user_feedback_targets_user_id_fkey",
        )?;
        fk(
            tables.target_exists(self.feedback_target_id),
            Self::NAME,
            "user_feedback_targets_feedback_target_id_fkey",
        )
    }

    fn on_insert(&mut self, tables: &mut Tables) {
        tables.next_assignment_id += 1;
        self.id = Some(tables.next_assignment_id);
    }
}

impl MemRecord for Group {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn table(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
        &mut tables.data.groups
    }
}

/// Copy `columns` of `incoming` over `stored`.
fn apply_columns<E: MemRecord>(stored: &E, incoming: &E, columns: &[&str]) -> StoreResult<E> {
    let corrupt = |e: serde_json::Error| StoreError::Corrupt(e.to_string());
    let mut target = serde_json::to_value(stored).map_err(corrupt)?;
    let source = serde_json::to_value(incoming).map_err(corrupt)?;

    for column in columns {
        let value = source
            .get(column)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("{} has no column {column}", E::NAME)))?;
        target[*column] = value;
    }

    serde_json::from_value(target).map_err(corrupt)
}

/// Merge `rows` into `tables` as one statement would.
fn merge_into<E: MemRecord>(tables: &mut Tables, rows: &[E], policy: ConflictPolicy) -> StoreResult<Vec<E>> {
    let mut touched = BTreeSet::new();
    let mut written = Vec::new();

    for row in rows {
        row.check(tables)?;
        let key = row.key();
        let first_touch = touched.insert(key.clone());
        let existing = E::table(tables).get(&key).cloned();

        match (existing, policy) {
            (None, _) => {
                let mut inserted = row.clone();
                inserted.on_insert(tables);
                E::table(tables).insert(key, inserted.clone());
                written.push(inserted);
            },
            (Some(_), ConflictPolicy::Ignore) => {},
            (Some(_), ConflictPolicy::Update(_)) if !first_touch => {
                return Err(StoreError::constraint(
                    E::NAME,
                    "ON CONFLICT DO UPDATE command cannot affect row a second time",
                ));
            },
            (Some(stored), ConflictPolicy::Update(columns)) => {
                let updated = apply_columns(&stored, row, columns)?;
                E::table(tables).insert(key, updated.clone());
                written.push(updated);
            },
        }
    }

    Ok(written)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_next_batch: Mutex<Option<StoreError>>,
    fail_cascade_at: Mutex<Option<CascadeStep>>,
    cascade_log: Mutex<Vec<CascadeStep>>,
}

impl MemoryStore {
    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.lock().unwrap())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.with(|t| t.data.clone())
    }

    /// Make the next batch merge fail with `error` without touching data.
    pub fn fail_next_batch(&self, error: StoreError) {
        *self.fail_next_batch.lock().unwrap() = Some(error);
    }

    /// Make the next cleanup fail when it reaches `step`.
    pub fn fail_cascade_at(&self, step: CascadeStep) {
        *self.fail_cascade_at.lock().unwrap() = Some(step);
    }

    pub fn cascade_log(&self) -> Vec<CascadeStep> {
        self.cascade_log.lock().unwrap().clone()
    }

    pub fn seed_users(&self, users: &[User]) {
        self.with(|t| {
            for user in users {
                t.data.users.insert(user.id.clone(), user.clone());
            }
        });
    }

    pub fn seed_organisations(&self, ids: &[&str]) {
        self.with(|t| {
            for id in ids {
                t.data.organisations.insert(
                    id.to_string(),
                    Organisation {
                        id: id.to_string(),
                        code: Some(id.to_uppercase()),
                        name: LocalizedText::default(),
                        parent_id: None,
                    },
                );
            }
        });
    }

    /// A generated target with its course unit and realisation.
    pub fn seed_feedback_target(&self, realisation_id: &str, course_unit_id: &str) -> i32 {
        self.with(|t| {
            t.data
                .course_units
                .entry(course_unit_id.to_string())
                .or_insert_with(|| CourseUnit {
                    id: course_unit_id.to_string(),
                    course_code: course_unit_id.to_uppercase(),
                    name: LocalizedText::default(),
                    validity_period: ValidityPeriod::default(),
                });
            t.data
                .realisations
                .entry(realisation_id.to_string())
                .or_insert_with(|| CourseRealisation {
                    id: realisation_id.to_string(),
                    name: LocalizedText::default(),
                    start_date: None,
                    end_date: None,
                    educational_institution_urn: None,
                    is_mooc_course: false,
                    teaching_languages: None,
                });
            insert_target(t, realisation_id, course_unit_id, realisation_id, false)
        })
    }

    /// A teacher-created target next to the generated one.
    pub fn seed_interim_target(&self, realisation_id: &str, course_unit_id: &str) -> i32 {
        self.with(|t| {
            let type_id = format!("{realisation_id}-interim-{}", t.next_target_id + 1);
            insert_target(t, realisation_id, course_unit_id, &type_id, true)
        })
    }

    /// Rows of every cascade table hanging off `realisation_id`.
    pub fn seed_dependants(&self, realisation_id: &str, target_id: i32) {
        self.seed_organisations(&["org-dependant"]);
        self.with(|t| {
            let teacher = test_user("teacher-dependant");
            t.data.users.entry(teacher.id.clone()).or_insert(teacher);
            insert_assignment(t, "teacher-dependant", target_id, AccessStatus::ResponsibleTeacher, false);
            t.logs.push(target_id);
            t.surveys.push(target_id);
            t.data.groups.insert(
                format!("group-{target_id}"),
                Group {
                    id: format!("group-{target_id}"),
                    feedback_target_id: target_id,
                    name: LocalizedText::default(),
                },
            );
            t.data.realisation_organisations.insert(
                (realisation_id.to_string(), "org-dependant".to_string()),
                CourseRealisationOrganisation {
                    course_realisation_id: realisation_id.to_string(),
                    organisation_id: "org-dependant".to_string(),
                    link_type: LinkType::Primary,
                },
            );
            t.tags.push(realisation_id.to_string());
        });
    }

    /// Feedback `answers` of `user_id` on a target, creating the student
    /// assignment when needed.
    pub fn seed_feedback(&self, target_id: i32, user_id: &str, answers: Value) {
        self.with(|t| {
            let user = test_user(user_id);
            t.data.users.entry(user.id.clone()).or_insert(user);
            let key = insert_assignment(t, user_id, target_id, AccessStatus::Student, false);
            t.feedback.insert(key, answers);
        });
    }

    pub fn seed_assignment(&self, user_id: &str, target_id: i32, status: AccessStatus, user_created: bool) -> i64 {
        self.with(|t| {
            let user = test_user(user_id);
            t.data.users.entry(user.id.clone()).or_insert(user);
            let key = insert_assignment(t, user_id, target_id, status, user_created);
            t.data.assignments.get(&key).and_then(|a| a.id).unwrap_or_default()
        })
    }

    pub fn mark_open_email_sent(&self, user_id: &str, target_id: i32) {
        self.with(|t| {
            t.open_email_sent
                .insert((user_id.to_string(), target_id, RoleClass::Student));
        });
    }

    pub fn mark_dates_edited(&self, type_id: &str) {
        self.with(|t| {
            t.dates_edited.insert(type_id.to_string());
        });
    }

    pub fn enable_inactive(&self, realisation_id: &str) {
        self.with(|t| {
            t.data.manually_enabled.insert(realisation_id.to_string());
        });
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.with(|t| t.data.users.get(id).cloned())
    }

    pub fn course_unit(&self, id: &str) -> Option<CourseUnit> {
        self.with(|t| t.data.course_units.get(id).cloned())
    }

    pub fn realisation(&self, id: &str) -> Option<CourseRealisation> {
        self.with(|t| t.data.realisations.get(id).cloned())
    }

    pub fn feedback_target(&self, type_id: &str) -> Option<FeedbackTarget> {
        self.with(|t| {
            t.data
                .feedback_targets
                .get(&(FEEDBACK_TYPE_COURSE_REALISATION.to_string(), type_id.to_string()))
                .cloned()
        })
    }

    pub fn assignments_of(&self, target_id: i32) -> Vec<UserFeedbackTarget> {
        self.with(|t| {
            t.data
                .assignments
                .values()
                .filter(|a| a.feedback_target_id == target_id)
                .cloned()
                .collect()
        })
    }

    pub fn hidden_count(&self, target_id: i32) -> i64 {
        self.with(|t| t.data.hidden_counts.get(&target_id).copied().unwrap_or_default())
    }
}

fn test_user(id: &str) -> User {
    User {
        id: id.to_string(),
        username: id.to_string(),
        first_name: None,
        last_name: None,
        email: None,
        secondary_email: None,
        employee_number: None,
        student_number: None,
        language: Some("en".to_string()),
        degree_study_right: None,
    }
}

fn insert_target(t: &mut Tables, realisation_id: &str, course_unit_id: &str, type_id: &str, user_created: bool) -> i32 {
    t.next_target_id += 1;
    let id = t.next_target_id;
    t.data.feedback_targets.insert(
        (FEEDBACK_TYPE_COURSE_REALISATION.to_string(), type_id.to_string()),
        FeedbackTarget {
            id: Some(id),
            feedback_type: FEEDBACK_TYPE_COURSE_REALISATION.to_string(),
            type_id: type_id.to_string(),
            course_unit_id: course_unit_id.to_string(),
            course_realisation_id: realisation_id.to_string(),
            name: LocalizedText::default(),
            hidden: false,
            opens_at: None,
            closes_at: None,
        },
    );
    if user_created {
        t.user_created_targets.insert(id);
    }
    id
}

fn realisations_without_feedback(t: &Tables, ids: &[String]) -> Vec<String> {
    let with_feedback: HashSet<&str> = t
        .feedback
        .keys()
        .filter_map(|(_, target_id, _)| {
            t.target_ids()
                .find(|(id, _)| id == target_id)
                .map(|(_, target)| target.course_realisation_id.as_str())
        })
        .collect();

    let mut deletable: Vec<String> = ids
        .iter()
        .filter(|id| t.data.realisations.contains_key(*id) && !with_feedback.contains(id.as_str()))
        .cloned()
        .collect();
    deletable.sort();
    deletable.dedup();
    deletable
}

fn delete_cascade_step(
    t: &mut Tables,
    step: CascadeStep,
    feedback_target_ids: &[i32],
    realisation_ids: &[String],
) -> u64 {
    let on_target = |id: &i32| feedback_target_ids.contains(id);
    let on_realisation = |id: &String| realisation_ids.contains(id);

    fn count<T>(items: &mut Vec<T>, drop: impl Fn(&T) -> bool) -> u64 {
        let before = items.len();
        items.retain(|i| !drop(i));
        (before - items.len()) as u64
    }
    fn count_map<K: Ord, V>(items: &mut BTreeMap<K, V>, drop: impl Fn(&V) -> bool) -> u64 {
        let before = items.len();
        items.retain(|_, v| !drop(v));
        (before - items.len()) as u64
    }

    match step {
        CascadeStep::Assignments => count_map(&mut t.data.assignments, |a| on_target(&a.feedback_target_id)),
        CascadeStep::Logs => count(&mut t.logs, on_target),
        CascadeStep::Surveys => count(&mut t.surveys, on_target),
        CascadeStep::FeedbackTargets => {
            count_map(&mut t.data.feedback_targets, |ft| ft.id.is_some_and(|id| on_target(&id)))
        },
        CascadeStep::Groups => count_map(&mut t.data.groups, |g| on_target(&g.feedback_target_id)),
        CascadeStep::OrganisationLinks => count_map(&mut t.data.realisation_organisations, |l| {
            on_realisation(&l.course_realisation_id)
        }),
        CascadeStep::TagLinks => count(&mut t.tags, on_realisation),
        CascadeStep::Realisations => count_map(&mut t.data.realisations, |r| on_realisation(&r.id)),
    }
}

/// `answer ->> 'hidden' = 'true'`
fn is_hidden_answer(answer: &Value) -> bool {
    match answer.get("hidden") {
        Some(Value::Bool(hidden)) => *hidden,
        Some(Value::String(hidden)) => hidden == "true",
        _ => false,
    }
}

fn insert_assignment(
    t: &mut Tables,
    user_id: &str,
    target_id: i32,
    status: AccessStatus,
    user_created: bool,
) -> AssignmentKey {
    let key = (user_id.to_string(), target_id, status.role_class());
    if !t.data.assignments.contains_key(&key) {
        t.next_assignment_id += 1;
        t.data.assignments.insert(
            key.clone(),
            UserFeedbackTarget {
                id: Some(t.next_assignment_id),
                user_id: user_id.to_string(),
                feedback_target_id: target_id,
                access_status: status,
                is_administrative_person: false,
                group_ids: None,
                user_created,
            },
        );
    }
    key
}

#[async_trait]
impl<E: MemRecord> MergeTarget<E> for MemoryStore {
    async fn merge_batch(&self, rows: &[E], policy: ConflictPolicy) -> StoreResult<Vec<E>> {
        if let Some(error) = self.fail_next_batch.lock().unwrap().take() {
            return Err(error);
        }

        let mut tables = self.tables.lock().unwrap();
        let mut draft = tables.clone();
        let written = merge_into(&mut draft, rows, policy)?;
        *tables = draft;
        Ok(written)
    }

    async fn merge_row(&self, row: &E, policy: ConflictPolicy) -> StoreResult<Option<E>> {
        let mut tables = self.tables.lock().unwrap();
        let mut draft = tables.clone();
        let written = merge_into(&mut draft, std::slice::from_ref(row), policy)?;
        *tables = draft;
        Ok(written.into_iter().next())
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn course_unit_by_code(&self, code: &str) -> StoreResult<Option<CourseUnit>> {
        Ok(self.with(|t| {
            t.data
                .course_units
                .values()
                .find(|u| u.course_code == code)
                .cloned()
        }))
    }

    async fn course_units_by_code_prefix(&self, prefix: &str) -> StoreResult<Vec<CourseUnit>> {
        let prefix = prefix.to_lowercase();
        Ok(self.with(|t| {
            t.data
                .course_units
                .values()
                .filter(|u| u.course_code.to_lowercase().starts_with(&prefix) && !u.course_code.starts_with("AY"))
                .cloned()
                .collect()
        }))
    }

    async fn primary_organisation_of(&self, course_unit_id: &str) -> StoreResult<Option<String>> {
        Ok(self.with(|t| {
            t.data
                .course_unit_organisations
                .values()
                .find(|l| l.course_unit_id == course_unit_id && l.link_type == LinkType::Primary)
                .map(|l| l.organisation_id.clone())
        }))
    }

    async fn existing_course_unit_ids(&self, ids: &[String]) -> StoreResult<HashSet<String>> {
        Ok(self.with(|t| {
            ids.iter()
                .filter(|id| t.data.course_units.contains_key(*id))
                .cloned()
                .collect()
        }))
    }

    async fn manually_enabled_realisation_ids(&self) -> StoreResult<HashSet<String>> {
        Ok(self.with(|t| t.data.manually_enabled.iter().cloned().collect()))
    }

    async fn type_ids_with_edited_dates(&self, type_ids: &[String]) -> StoreResult<HashSet<String>> {
        Ok(self.with(|t| {
            type_ids
                .iter()
                .filter(|id| t.dates_edited.contains(*id))
                .cloned()
                .collect()
        }))
    }

    async fn feedback_targets_of_realisations(
        &self,
        realisation_ids: &[String],
    ) -> StoreResult<Vec<FeedbackTargetRef>> {
        Ok(self.with(|t| {
            let mut refs: Vec<FeedbackTargetRef> = t
                .target_ids()
                .filter(|(_, target)| realisation_ids.contains(&target.course_realisation_id))
                .map(|(id, target)| FeedbackTargetRef {
                    id,
                    course_realisation_id: target.course_realisation_id.clone(),
                })
                .collect();
            refs.sort_by_key(|r| r.id);
            refs
        }))
    }

    async fn delete_teacher_rights_without_feedback(&self) -> StoreResult<u64> {
        Ok(self.with(|t| {
            let feedback = t.feedback.clone();
            let before = t.data.assignments.len();
            t.data
                .assignments
                .retain(|key, a| !a.access_status.is_teacher() || feedback.contains_key(key));
            (before - t.data.assignments.len()) as u64
        }))
    }

    async fn delete_student_assignments(&self, pairs: &[(String, i32)]) -> StoreResult<u64> {
        Ok(self.with(|t| {
            let mut deleted = 0;
            for (user_id, target_id) in pairs {
                let key = (user_id.clone(), *target_id, RoleClass::Student);
                let removable = t.data.assignments.get(&key).is_some_and(|a| !a.user_created)
                    && !t.open_email_sent.contains(&key)
                    && !t.feedback.contains_key(&key);
                if removable {
                    t.data.assignments.remove(&key);
                    deleted += 1;
                }
            }
            deleted
        }))
    }

    async fn user_feedback_targets_of(&self, feedback_target_id: i32) -> StoreResult<Vec<UserFeedbackTarget>> {
        Ok(self.assignments_of(feedback_target_id))
    }

    async fn delete_user_feedback_targets(&self, ids: &[i64]) -> StoreResult<u64> {
        Ok(self.with(|t| {
            let before = t.data.assignments.len();
            t.data
                .assignments
                .retain(|_, a| a.id.map_or(true, |id| !ids.contains(&id)));
            (before - t.data.assignments.len()) as u64
        }))
    }

    async fn delete_realisations_without_feedback(&self, ids: &[String]) -> StoreResult<CleanupReport> {
        let fail_at = self.fail_cascade_at.lock().unwrap().take();
        let mut tables = self.tables.lock().unwrap();

        let deletable = realisations_without_feedback(&tables, ids);
        let mut report = CleanupReport::default();
        if deletable.is_empty() {
            return Ok(report);
        }

        let target_ids: Vec<i32> = tables
            .target_ids()
            .filter(|(_, target)| deletable.contains(&target.course_realisation_id))
            .map(|(id, _)| id)
            .collect();

        // Steps run on a copy that replaces the tables only once all succeed.
        let mut working = tables.clone();
        for step in CascadeStep::ORDER {
            self.cascade_log.lock().unwrap().push(step);
            if fail_at == Some(step) {
                return Err(StoreError::Sqlx(sqlx::Error::PoolTimedOut));
            }
            let rows = delete_cascade_step(&mut working, step, &target_ids, &deletable);
            report.rows_deleted.push((step, rows));
        }
        *tables = working;

        report.deleted_realisations = deletable;
        Ok(report)
    }

    async fn update_hidden_counts(&self) -> StoreResult<u64> {
        Ok(self.with(|t| {
            let mut counts: BTreeMap<i32, i64> = t.target_ids().map(|(id, _)| (id, 0)).collect();
            for ((_, target_id, _), answers) in &t.feedback {
                let hidden = answers
                    .as_array()
                    .map_or(0, |items| items.iter().filter(|a| is_hidden_answer(a)).count());
                if let Some(count) = counts.get_mut(target_id) {
                    *count += hidden as i64;
                }
            }

            let mut updated = 0;
            for (id, count) in counts {
                let stored = t.data.hidden_counts.get(&id).copied().unwrap_or_default();
                if stored != count {
                    t.data.hidden_counts.insert(id, count);
                    updated += 1;
                }
            }
            updated
        }))
    }

    async fn interim_target_sets(&self) -> StoreResult<Vec<InterimTargetSet>> {
        Ok(self.with(|t| {
            let mut sets = Vec::new();
            for (id, target) in t.target_ids() {
                let realisation = &target.course_realisation_id;
                if t.user_created_targets.contains(&id) || t.user_created_realisations.contains(realisation) {
                    continue;
                }
                let interim_target_ids: Vec<i32> = t
                    .target_ids()
                    .filter(|(other, ft)| {
                        &ft.course_realisation_id == realisation && t.user_created_targets.contains(other)
                    })
                    .map(|(other, _)| other)
                    .collect();
                if !interim_target_ids.is_empty() {
                    sets.push(InterimTargetSet {
                        course_realisation_id: realisation.clone(),
                        original_target_id: id,
                        interim_target_ids,
                    });
                }
            }
            sets.sort_by_key(|s| s.original_target_id);
            sets
        }))
    }
}

/// Offset store keeping per-key write counts.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    cursors: Mutex<BTreeMap<String, String>>,
    writes: Mutex<HashMap<String, usize>>,
}

impl MemoryOffsetStore {
    pub fn write_count(&self, key: &str) -> usize {
        self.writes.lock().unwrap().get(key).copied().unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.cursors.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.cursors.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, cursor: &str) -> StoreResult<()> {
        self.cursors
            .lock()
            .unwrap()
            .insert(key.to_string(), cursor.to_string());
        *self.writes.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.cursors.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys_matching(&self, suffix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .cursors
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.ends_with(suffix))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobRunStore {
    runs: Mutex<Vec<JobRun>>,
    clock: Option<DateTime<Utc>>,
}

impl MemoryJobRunStore {
    /// Store stamping every created run with `started_at`.
    pub fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            runs: Mutex::default(),
            clock: Some(started_at),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// A RUNNING row left behind by a dead process.
    pub fn seed_running(&self, job_type: &str, minutes_ago: i64) -> Uuid {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            status: JobStatus::Running,
            started_at: self.now() - chrono::Duration::minutes(minutes_ago),
            finished_at: None,
            error: None,
        };
        let id = run.id;
        self.runs.lock().unwrap().push(run);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<JobRun> {
        self.runs.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    pub fn all(&self) -> Vec<JobRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunStore for MemoryJobRunStore {
    async fn create_running(&self, job_type: &str) -> StoreResult<JobRun> {
        let mut runs = self.runs.lock().unwrap();
        if runs
            .iter()
            .any(|r| r.job_type == job_type && r.status == JobStatus::Running)
        {
            return Err(StoreError::AlreadyRunning(job_type.to_string()));
        }
        let run = JobRun {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            status: JobStatus::Running,
            started_at: self.now(),
            finished_at: None,
            error: None,
        };
        runs.push(run.clone());
        Ok(run)
    }

    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<&str>) -> StoreResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.id == id && r.status == JobStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("RUNNING job run '{id}' not found")))?;
        run.status = status;
        run.finished_at = Some(self.now());
        run.error = error.map(str::to_string);
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn latest(&self, limit: i64) -> StoreResult<Vec<JobRun>> {
        let mut runs = self.all();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }
}
