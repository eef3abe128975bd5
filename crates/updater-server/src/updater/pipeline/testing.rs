//! Importer fixtures for pipeline tests

use super::{Pipeline, PipelineSettings, RunContext};
use crate::store::memory::{MemoryOffsetStore, MemoryStore};
use crate::updater::importer::{ImporterError, PageRequest, SourceResponse, UpstreamSource};
use crate::updater::reconcile::realisations::{INDEPENDENT_WORK_TYPE, VALID_REALISATION_TYPES};
use crate::updater::reconcile::similarity::NormalizedLevenshtein;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const RESPONSIBLE_URN: &str = "urn:code:course-unit-realisation-responsibility-info-type:responsible-teacher";
pub const TEACHER_URN: &str = "urn:code:course-unit-realisation-responsibility-info-type:teacher";
pub const ADMIN_URN: &str = "urn:code:course-unit-realisation-responsibility-info-type:administrative-person";

/// Upstream serving fixed records per path, paged by offset and limit.
#[derive(Default)]
pub struct FixtureSource {
    streams: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl FixtureSource {
    pub fn with(self, path: &str, records: Vec<Value>) -> Self {
        self.set(path, records);
        self
    }

    pub fn set(&self, path: &str, records: Vec<Value>) {
        self.streams.lock().unwrap().insert(path.to_string(), records);
    }

    /// Answer every request for `path` with a 502 until [`Self::heal`].
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn heal(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    pub fn requests_for(&self, path: &str) -> Vec<PageRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UpstreamSource for FixtureSource {
    async fn fetch(&self, request: &PageRequest) -> Result<SourceResponse, ImporterError> {
        self.requests.lock().unwrap().push(request.clone());

        if self.failing.lock().unwrap().contains(&request.path) {
            return Err(ImporterError::Status {
                path: request.path.clone(),
                status: reqwest::StatusCode::BAD_GATEWAY,
            });
        }

        let streams = self.streams.lock().unwrap();
        let records = streams.get(&request.path).cloned().unwrap_or_default();
        let start = (request.offset.unwrap_or(0) as usize).min(records.len());
        let end = request
            .limit
            .map_or(records.len(), |limit| (start + limit as usize).min(records.len()));

        Ok(SourceResponse::Ready(records[start..end].to_vec()))
    }
}

pub fn person(id: &str, first_names: &str, last_name: &str) -> Value {
    json!({
        "id": id,
        "firstNames": first_names,
        "lastName": last_name,
        "primaryEmail": format!("{id}@example.org"),
        "eduPersonPrincipalName": format!("{id}@helsinki.fi"),
        "preferredLanguageUrn": "urn:code:language:fi",
    })
}

pub fn organisation(id: &str, code: &str) -> Value {
    json!({ "id": id, "code": code, "name": { "fi": code, "en": code } })
}

pub fn course_unit(id: &str, code: &str, name: &str, start: &str, organisation: &str) -> Value {
    json!({
        "id": id,
        "code": code,
        "name": { "en": name },
        "validityPeriod": { "startDate": start },
        "organisations": [{ "organisationId": organisation, "share": 1.0 }],
    })
}

pub fn enrolment(person: &str, realisation: &str, groups: &[&str]) -> Value {
    json!({
        "personId": person,
        "courseUnitRealisationId": realisation,
        "confirmedStudySubGroupIds": groups,
    })
}

/// Builder for `course_unit_realisations_with_course_units` records.
pub struct RealisationJson(Value);

impl RealisationJson {
    pub fn new(id: &str, name: &str, start: &str, end: &str) -> Self {
        Self(json!({
            "id": id,
            "name": { "en": name },
            "activityPeriod": { "startDate": start, "endDate": end },
            "courseUnitRealisationTypeUrn": VALID_REALISATION_TYPES[4],
            "flowState": "PUBLISHED",
            "organisations": [],
            "courseUnits": [],
            "responsibilityInfos": [],
            "studyGroupSets": [],
        }))
    }

    fn push(mut self, field: &str, value: Value) -> Self {
        if let Some(items) = self.0[field].as_array_mut() {
            items.push(value);
        }
        self
    }

    pub fn course_unit(self, unit: Value) -> Self {
        self.push("courseUnits", unit)
    }

    pub fn organisation(self, organisation: &str, share: f64) -> Self {
        self.push("organisations", json!({ "organisationId": organisation, "share": share }))
    }

    pub fn teacher(self, person: &str, role_urn: &str) -> Self {
        self.push("responsibilityInfos", json!({ "personId": person, "roleUrn": role_urn }))
    }

    /// One group set with `(sub group id, teacher ids)` entries.
    pub fn sub_groups(self, groups: &[(&str, &[&str])]) -> Self {
        let sub_groups: Vec<Value> = groups
            .iter()
            .map(|(id, teachers)| json!({ "id": id, "name": { "en": id }, "teacherIds": teachers }))
            .collect();
        self.push("studyGroupSets", json!({ "studySubGroups": sub_groups }))
    }

    pub fn independent_work(mut self) -> Self {
        self.0["courseUnitRealisationTypeUrn"] = json!(INDEPENDENT_WORK_TYPE);
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.0["flowState"] = json!("CANCELLED");
        self
    }

    pub fn build(self) -> Value {
        self.0
    }
}

pub fn algorithms_units() -> [Value; 2] {
    [
        course_unit("cu-alg-2020", "TKT200", "Algorithms", "2020-08-01", "org-cs"),
        course_unit("cu-alg-2023", "TKT201", "Algorithms", "2023-08-01", "org-cs"),
    ]
}

/// A small university: four people, two organisations, three realisations
/// and their enrolments.
pub fn university() -> FixtureSource {
    let [alg_2020, alg_2023] = algorithms_units();

    let algorithms = RealisationJson::new("cur-alg", "Algorithms, Lecture", "2023-09-01", "2023-12-16")
        .course_unit(alg_2020)
        .course_unit(alg_2023.clone())
        .organisation("org-cs", 1.0)
        .teacher("teacher-1", ADMIN_URN)
        .teacher("teacher-1", RESPONSIBLE_URN)
        .teacher("teacher-2", TEACHER_URN)
        .sub_groups(&[("group-a", &["teacher-2"]), ("group-b", &[])])
        .build();

    let open = RealisationJson::new("cur-open", "Algorithms", "2023-09-01", "2023-12-16")
        .course_unit(course_unit("cu-open", "AYTKT201", "Algorithms", "2023-08-01", "org-open"))
        .organisation("org-open", 1.0)
        .teacher("teacher-2", RESPONSIBLE_URN)
        .build();

    let thesis = RealisationJson::new("cur-thesis", "Thesis work", "2023-09-01", "2024-06-01")
        .course_unit(alg_2023)
        .independent_work()
        .build();

    FixtureSource::default()
        .with(
            super::PERSONS_STREAM,
            vec![
                person("teacher-1", "Matti Juhani", "Luukkainen"),
                person("teacher-2", "Leena", "Salmela"),
                person("student-1", "Aino", "Virtanen"),
                person("student-2", "Eero", "Korhonen"),
            ],
        )
        .with(
            super::ORGANISATIONS_STREAM,
            vec![organisation("org-cs", "H523"), organisation("org-open", "H930")],
        )
        .with(super::COURSES_STREAM, vec![algorithms, open, thesis])
        .with(
            super::ENROLMENTS_STREAM,
            vec![
                enrolment("student-1", "cur-alg", &["group-a"]),
                enrolment("student-2", "cur-alg", &[]),
                enrolment("student-2", "cur-open", &[]),
            ],
        )
}

/// Pipeline over memory stores with pages of two records.
pub fn pipeline(store: &Arc<MemoryStore>, offsets: &Arc<MemoryOffsetStore>, source: &Arc<FixtureSource>) -> Pipeline {
    Pipeline::new(
        store.clone(),
        offsets.clone(),
        source.clone(),
        Arc::new(NormalizedLevenshtein),
        PipelineSettings {
            persons_page_size: 2,
            organisations_page_size: 2,
            courses_page_size: 2,
            enrolments_page_size: 2,
            ..PipelineSettings::default()
        },
    )
}

/// Wednesday 2024-03-06 at 01:30 Helsinki time.
pub fn wednesday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 23, 30, 0).unwrap()
}

/// Sunday 2024-03-10 at 01:30 Helsinki time.
pub fn sunday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 9, 23, 30, 0).unwrap()
}

pub fn context_at(started_at: DateTime<Utc>) -> RunContext {
    RunContext {
        run_id: Uuid::new_v4(),
        started_at,
    }
}
