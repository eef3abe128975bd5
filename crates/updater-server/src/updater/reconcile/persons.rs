//! Person records to users

use crate::models::User;
use crate::updater::bulk::ConflictPolicy;
use crate::updater::importer::records::PersonRecord;

const SUPPORTED_LANGUAGES: [&str; 3] = ["fi", "en", "sv"];
const FALLBACK_LANGUAGE: &str = "en";

/// Columns refreshed from upstream. Login and other application-owned
/// columns are never listed.
pub const USER_UPDATE: ConflictPolicy = ConflictPolicy::Update(&[
    "first_name",
    "username",
    "last_name",
    "student_number",
    "employee_number",
    "language",
    "email",
    "degree_study_right",
    "secondary_email",
]);

pub fn to_user(person: &PersonRecord) -> User {
    let (email, secondary_email) = match &person.primary_email {
        Some(primary) => (Some(primary.clone()), person.secondary_email.clone()),
        None => (person.secondary_email.clone(), None),
    };

    User {
        id: person.id.clone(),
        username: username(person),
        first_name: first_name(person),
        last_name: person.last_name.clone(),
        email,
        secondary_email,
        employee_number: person.employee_number.clone(),
        student_number: person.student_number.clone(),
        language: Some(language(person.preferred_language_urn.as_deref()).to_string()),
        degree_study_right: person.has_study_right,
    }
}

/// Last segment of the preferred-language URN when supported.
pub fn language(urn: Option<&str>) -> &str {
    urn.and_then(|u| u.rsplit(':').next())
        .filter(|lang| SUPPORTED_LANGUAGES.contains(lang))
        .unwrap_or(FALLBACK_LANGUAGE)
}

fn first_name(person: &PersonRecord) -> Option<String> {
    person.call_name.clone().or_else(|| {
        person
            .first_names
            .as_deref()
            .and_then(|names| names.split(' ').next())
            .map(str::to_string)
    })
}

fn username(person: &PersonRecord) -> String {
    person
        .edu_person_principal_name
        .as_deref()
        .and_then(|principal| principal.split('@').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(&person.id)
        .to_string()
}
