//! Typed upstream records
//!
//! Field names follow the importer's camelCase JSON. Optional collections
//! default to empty so a missing array never fails a whole page.

use crate::models::{LocalizedText, ValidityPeriod};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    pub id: String,
    #[serde(default)]
    pub first_names: Option<String>,
    #[serde(default)]
    pub call_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub primary_email: Option<String>,
    #[serde(default)]
    pub secondary_email: Option<String>,
    #[serde(default)]
    pub preferred_language_urn: Option<String>,
    #[serde(default)]
    pub edu_person_principal_name: Option<String>,
    #[serde(default)]
    pub student_number: Option<String>,
    #[serde(default)]
    pub employee_number: Option<String>,
    #[serde(default, rename = "has_study_right")]
    pub has_study_right: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganisationRecord {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganisationShare {
    #[serde(default)]
    pub organisation_id: Option<String>,
    #[serde(default)]
    pub share: f64,
    #[serde(default)]
    pub role_urn: Option<String>,
    #[serde(default)]
    pub educational_institution_urn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseUnitRecord {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default)]
    pub validity_period: ValidityPeriod,
    #[serde(default)]
    pub organisations: Vec<OrganisationShare>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPeriod {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Exclusive: the realisation ends the day before.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsibilityInfo {
    #[serde(default)]
    pub person_id: Option<String>,
    #[serde(default)]
    pub role_urn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySubGroup {
    pub id: String,
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default)]
    pub teacher_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyGroupSet {
    #[serde(default)]
    pub study_sub_groups: Vec<StudySubGroup>,
}

/// A course unit realisation together with its course units, as served by
/// `course_unit_realisations_with_course_units`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealisationRecord {
    pub id: String,
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default)]
    pub activity_period: ActivityPeriod,
    #[serde(default)]
    pub organisations: Vec<OrganisationShare>,
    #[serde(default)]
    pub custom_code_urns: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub course_units: Vec<CourseUnitRecord>,
    #[serde(default)]
    pub course_unit_realisation_type_urn: Option<String>,
    #[serde(default)]
    pub flow_state: Option<String>,
    #[serde(default)]
    pub responsibility_infos: Vec<ResponsibilityInfo>,
    #[serde(default)]
    pub study_group_sets: Vec<StudyGroupSet>,
}

impl RealisationRecord {
    pub fn is_cancelled(&self) -> bool {
        self.flow_state.as_deref() == Some("CANCELLED")
    }
}

/// An enrolment, or a withdrawn one on the `deleted-enrolments` stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolmentRecord {
    #[serde(default)]
    pub person_id: Option<String>,
    pub course_unit_realisation_id: String,
    #[serde(default)]
    pub confirmed_study_sub_group_ids: Vec<String>,
}
