//! Local entities written by the updater
//!
//! Each struct mirrors the columns the updater owns in its table. Columns
//! owned by the downstream application (`user_created` on feedback targets,
//! `manually_enabled` on inactive realisations, counts, login timestamps)
//! are deliberately absent so no write path can clobber them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A row type the bulk writer can merge.
pub trait Entity: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Name used in logs and skipped-row reports.
    const NAME: &'static str;
}

#[derive(Error, Debug)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Text in the three supported languages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sv: Option<String>,
}

impl LocalizedText {
    pub fn new(fi: &str, en: &str, sv: &str) -> Self {
        Self {
            fi: Some(fi.to_string()),
            en: Some(en.to_string()),
            sv: Some(sv.to_string()),
        }
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        match language {
            "fi" => self.fi.as_deref(),
            "en" => self.en.as_deref(),
            "sv" => self.sv.as_deref(),
            _ => None,
        }
    }

    /// Non-empty translations as `(language, text)` pairs.
    pub fn translations(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [("fi", &self.fi), ("en", &self.en), ("sv", &self.sv)]
            .into_iter()
            .filter_map(|(lang, text)| {
                text.as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| (lang, t))
            })
    }
}

/// Name of every generated realisation feedback target.
pub fn common_feedback_name() -> LocalizedText {
    LocalizedText::new(
        "Yleinen palaute kurssista",
        "General feedback about the course",
        "Allmän respons om kursen",
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityPeriod {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

/// Role of a person on a feedback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessStatus {
    Student,
    Teacher,
    ResponsibleTeacher,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Student => "STUDENT",
            AccessStatus::Teacher => "TEACHER",
            AccessStatus::ResponsibleTeacher => "RESPONSIBLE_TEACHER",
        }
    }

    pub fn role_class(&self) -> RoleClass {
        match self {
            AccessStatus::Student => RoleClass::Student,
            AccessStatus::Teacher | AccessStatus::ResponsibleTeacher => RoleClass::Teaching,
        }
    }

    pub fn is_teacher(&self) -> bool {
        self.role_class() == RoleClass::Teaching
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AccessStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "STUDENT" => Ok(AccessStatus::Student),
            "TEACHER" => Ok(AccessStatus::Teacher),
            "RESPONSIBLE_TEACHER" => Ok(AccessStatus::ResponsibleTeacher),
            _ => Err(ParseEnumError {
                kind: "access status",
                value,
            }),
        }
    }
}

/// Students and teaching staff hold separate assignments for the same
/// (user, feedback target) pair; roles within a class replace each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RoleClass {
    Student,
    Teaching,
}

/// Kind of organisation link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    Primary,
    Direct,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Primary => "PRIMARY",
            LinkType::Direct => "DIRECT",
        }
    }

    /// Links are ordered by share; the first one is primary.
    pub fn for_rank(rank: usize) -> Self {
        if rank == 0 {
            LinkType::Primary
        } else {
            LinkType::Direct
        }
    }
}

impl TryFrom<String> for LinkType {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PRIMARY" => Ok(LinkType::Primary),
            "DIRECT" => Ok(LinkType::Direct),
            _ => Err(ParseEnumError {
                kind: "link type",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub secondary_email: Option<String>,
    pub employee_number: Option<String>,
    pub student_number: Option<String>,
    pub language: Option<String>,
    pub degree_study_right: Option<bool>,
}

impl Entity for User {
    const NAME: &'static str = "User";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organisation {
    pub id: String,
    pub code: Option<String>,
    #[sqlx(json)]
    pub name: LocalizedText,
    pub parent_id: Option<String>,
}

impl Entity for Organisation {
    const NAME: &'static str = "Organisation";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseUnit {
    pub id: String,
    pub course_code: String,
    #[sqlx(json)]
    pub name: LocalizedText,
    #[sqlx(json)]
    pub validity_period: ValidityPeriod,
}

impl Entity for CourseUnit {
    const NAME: &'static str = "CourseUnit";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseUnitOrganisation {
    pub course_unit_id: String,
    pub organisation_id: String,
    #[sqlx(rename = "type", try_from = "String")]
    pub link_type: LinkType,
}

impl Entity for CourseUnitOrganisation {
    const NAME: &'static str = "CourseUnitOrganisation";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseRealisation {
    pub id: String,
    #[sqlx(json)]
    pub name: LocalizedText,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub educational_institution_urn: Option<String>,
    pub is_mooc_course: bool,
    pub teaching_languages: Option<Vec<String>>,
}

impl Entity for CourseRealisation {
    const NAME: &'static str = "CourseRealisation";
}

/// Independent-work realisations kept aside until someone enables them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InactiveCourseRealisation {
    pub id: String,
    #[sqlx(json)]
    pub name: LocalizedText,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub educational_institution_urn: Option<String>,
    pub is_mooc_course: bool,
    pub teaching_languages: Option<Vec<String>>,
}

impl Entity for InactiveCourseRealisation {
    const NAME: &'static str = "InactiveCourseRealisation";
}

impl From<CourseRealisation> for InactiveCourseRealisation {
    fn from(cr: CourseRealisation) -> Self {
        Self {
            id: cr.id,
            name: cr.name,
            start_date: cr.start_date,
            end_date: cr.end_date,
            educational_institution_urn: cr.educational_institution_urn,
            is_mooc_course: cr.is_mooc_course,
            teaching_languages: cr.teaching_languages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseRealisationOrganisation {
    pub course_realisation_id: String,
    pub organisation_id: String,
    #[sqlx(rename = "type", try_from = "String")]
    pub link_type: LinkType,
}

impl Entity for CourseRealisationOrganisation {
    const NAME: &'static str = "CourseRealisationOrganisation";
}

pub const FEEDBACK_TYPE_COURSE_REALISATION: &str = "courseRealisation";

/// One feedback collection instance, unique on (feedback_type, type_id).
/// `id` is `None` until the row has been stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedbackTarget {
    pub id: Option<i32>,
    pub feedback_type: String,
    pub type_id: String,
    pub course_unit_id: String,
    pub course_realisation_id: String,
    #[sqlx(json)]
    pub name: LocalizedText,
    pub hidden: bool,
    pub opens_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
}

impl Entity for FeedbackTarget {
    const NAME: &'static str = "FeedbackTarget";
}

/// A person's role on a feedback target, unique on
/// (user_id, feedback_target_id, role class).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserFeedbackTarget {
    pub id: Option<i64>,
    pub user_id: String,
    pub feedback_target_id: i32,
    #[sqlx(try_from = "String")]
    pub access_status: AccessStatus,
    pub is_administrative_person: bool,
    pub group_ids: Option<Vec<String>>,
    pub user_created: bool,
}

impl UserFeedbackTarget {
    pub fn key(&self) -> (&str, i32, RoleClass) {
        (
            &self.user_id,
            self.feedback_target_id,
            self.access_status.role_class(),
        )
    }
}

impl Entity for UserFeedbackTarget {
    const NAME: &'static str = "UserFeedbackTarget";
}

/// Study sub group attached to a feedback target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: String,
    pub feedback_target_id: i32,
    #[sqlx(json)]
    pub name: LocalizedText,
}

impl Entity for Group {
    const NAME: &'static str = "Group";
}

/// Stored feedback target id with its realisation.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedbackTargetRef {
    pub id: i32,
    pub course_realisation_id: String,
}

/// A realisation whose generated target has user-created interim copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterimTargetSet {
    pub course_realisation_id: String,
    pub original_target_id: i32,
    pub interim_target_ids: Vec<i32>,
}
