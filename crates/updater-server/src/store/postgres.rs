//! PostgreSQL adapter of the reconcile store
//!
//! Merges are single `INSERT ... ON CONFLICT` statements built with
//! `QueryBuilder::push_values`, so a batch is atomic and a row-scoped
//! violation anywhere rejects the whole batch.

use super::ReconcileStore;
use crate::db::StoreResult;
use crate::models::{
    AccessStatus, CourseRealisation, CourseRealisationOrganisation, CourseUnit, CourseUnitOrganisation,
    Entity, FeedbackTarget, FeedbackTargetRef, Group, InactiveCourseRealisation, InterimTargetSet,
    Organisation, User, UserFeedbackTarget,
};
use crate::updater::bulk::{ConflictPolicy, MergeTarget};
use crate::updater::reconcile::cleanup::{CascadeStep, CleanupReport};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;

/// Table mapping of an entity the store can merge.
pub trait PgRecord: Entity + for<'r> FromRow<'r, PgRow> + Unpin {
    const TABLE: &'static str;
    /// Inserted columns, in [`PgRecord::bind_columns`] order.
    const COLUMNS: &'static [&'static str];
    /// Conflict target, e.g. `(id)`.
    const CONFLICT_TARGET: &'static str;
    /// Link tables carry no timestamps.
    const TOUCHES_UPDATED_AT: bool = true;

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl PgRecord for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "username",
        "first_name",
        "last_name",
        "email",
        "secondary_email",
        "employee_number",
        "student_number",
        "language",
        "degree_study_right",
    ];
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.username.clone())
            .push_bind(self.first_name.clone())
            .push_bind(self.last_name.clone())
            .push_bind(self.email.clone())
            .push_bind(self.secondary_email.clone())
            .push_bind(self.employee_number.clone())
            .push_bind(self.student_number.clone())
            .push_bind(self.language.clone())
            .push_bind(self.degree_study_right);
    }
}

impl PgRecord for Organisation {
    const TABLE: &'static str = "organisations";
    const COLUMNS: &'static [&'static str] = &["id", "code", "name", "parent_id"];
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.code.clone())
            .push_bind(Json(self.name.clone()))
            .push_bind(self.parent_id.clone());
    }
}

impl PgRecord for CourseUnit {
    const TABLE: &'static str = "course_units";
    const COLUMNS: &'static [&'static str] = &["id", "course_code", "name", "validity_period"];
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.course_code.clone())
            .push_bind(Json(self.name.clone()))
            .push_bind(Json(self.validity_period.clone()));
    }
}

impl PgRecord for CourseUnitOrganisation {
    const TABLE: &'static str = "course_units_organisations";
    const COLUMNS: &'static [&'static str] = &["course_unit_id", "organisation_id", "type"];
    const CONFLICT_TARGET: &'static str = "(course_unit_id, organisation_id)";
    const TOUCHES_UPDATED_AT: bool = false;

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.course_unit_id.clone())
            .push_bind(self.organisation_id.clone())
            .push_bind(self.link_type.as_str());
    }
}

const REALISATION_COLUMNS: &[&str] = &[
    "id",
    "name",
    "start_date",
    "end_date",
    "educational_institution_urn",
    "is_mooc_course",
    "teaching_languages",
];

impl PgRecord for CourseRealisation {
    const TABLE: &'static str = "course_realisations";
    const COLUMNS: &'static [&'static str] = REALISATION_COLUMNS;
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(Json(self.name.clone()))
            .push_bind(self.start_date)
            .push_bind(self.end_date)
            .push_bind(self.educational_institution_urn.clone())
            .push_bind(self.is_mooc_course)
            .push_bind(self.teaching_languages.clone());
    }
}

impl PgRecord for InactiveCourseRealisation {
    const TABLE: &'static str = "inactive_course_realisations";
    const COLUMNS: &'static [&'static str] = REALISATION_COLUMNS;
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(Json(self.name.clone()))
            .push_bind(self.start_date)
            .push_bind(self.end_date)
            .push_bind(self.educational_institution_urn.clone())
            .push_bind(self.is_mooc_course)
            .push_bind(self.teaching_languages.clone());
    }
}

impl PgRecord for CourseRealisationOrganisation {
    const TABLE: &'static str = "course_realisations_organisations";
    const COLUMNS: &'static [&'static str] = &["course_realisation_id", "organisation_id", "type"];
    const CONFLICT_TARGET: &'static str = "(course_realisation_id, organisation_id)";
    const TOUCHES_UPDATED_AT: bool = false;

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.course_realisation_id.clone())
            .push_bind(self.organisation_id.clone())
            .push_bind(self.link_type.as_str());
    }
}

impl PgRecord for FeedbackTarget {
    const TABLE: &'static str = "feedback_targets";
    const COLUMNS: &'static [&'static str] = &[
        "feedback_type",
        "type_id",
        "course_unit_id",
        "course_realisation_id",
        "name",
        "hidden",
        "opens_at",
        "closes_at",
    ];
    const CONFLICT_TARGET: &'static str = "(feedback_type, type_id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.feedback_type.clone())
            .push_bind(self.type_id.clone())
            .push_bind(self.course_unit_id.clone())
            .push_bind(self.course_realisation_id.clone())
            .push_bind(Json(self.name.clone()))
            .push_bind(self.hidden)
            .push_bind(self.opens_at)
            .push_bind(self.closes_at);
    }
}

impl PgRecord for UserFeedbackTarget {
    const TABLE: &'static str = "user_feedback_targets";
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "feedback_target_id",
        "access_status",
        "is_administrative_person",
        "group_ids",
        "user_created",
    ];
    const CONFLICT_TARGET: &'static str = "(user_id, feedback_target_id, role_class)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.user_id.clone())
            .push_bind(self.feedback_target_id)
            .push_bind(self.access_status.as_str())
            .push_bind(self.is_administrative_person)
            .push_bind(self.group_ids.clone())
            .push_bind(self.user_created);
    }
}

impl PgRecord for Group {
    const TABLE: &'static str = "groups";
    const COLUMNS: &'static [&'static str] = &["id", "feedback_target_id", "name"];
    const CONFLICT_TARGET: &'static str = "(id)";

    fn bind_columns(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.feedback_target_id)
            .push_bind(Json(self.name.clone()));
    }
}

fn merge_statement<'a, E, I>(rows: I, policy: ConflictPolicy) -> QueryBuilder<'static, Postgres>
where
    E: PgRecord + 'a,
    I: IntoIterator<Item = &'a E>,
{
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", E::TABLE, E::COLUMNS.join(", ")));

    builder.push_values(rows, |mut row, entity| entity.bind_columns(&mut row));

    builder.push(" ON CONFLICT ");
    builder.push(E::CONFLICT_TARGET);
    match policy {
        ConflictPolicy::Ignore => {
            builder.push(" DO NOTHING");
        },
        ConflictPolicy::Update(columns) => {
            let mut assignments: Vec<String> = columns.iter().map(|c| format!("{c} = EXCLUDED.{c}")).collect();
            if E::TOUCHES_UPDATED_AT {
                assignments.push("updated_at = NOW()".to_string());
            }
            builder.push(" DO UPDATE SET ");
            builder.push(assignments.join(", "));
        },
    }
    builder.push(" RETURNING *");
    builder
}

/// Production store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl<E: PgRecord> MergeTarget<E> for PgStore {
    async fn merge_batch(&self, rows: &[E], policy: ConflictPolicy) -> StoreResult<Vec<E>> {
        let mut builder = merge_statement(rows, policy);
        let stored = builder.build_query_as::<E>().fetch_all(&self.pool).await?;
        Ok(stored)
    }

    async fn merge_row(&self, row: &E, policy: ConflictPolicy) -> StoreResult<Option<E>> {
        let mut builder = merge_statement(std::iter::once(row), policy);
        let stored = builder.build_query_as::<E>().fetch_optional(&self.pool).await?;
        Ok(stored)
    }
}

#[derive(FromRow)]
struct InterimRow {
    course_realisation_id: String,
    original_target_id: i32,
    interim_target_ids: Vec<i32>,
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn course_unit_by_code(&self, code: &str) -> StoreResult<Option<CourseUnit>> {
        let unit = sqlx::query_as::<_, CourseUnit>(
            "SELECT * FROM course_units WHERE course_code = $1 ORDER BY id LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(unit)
    }

    async fn course_units_by_code_prefix(&self, prefix: &str) -> StoreResult<Vec<CourseUnit>> {
        let units = sqlx::query_as::<_, CourseUnit>(
            r#"
            SELECT * FROM course_units
            WHERE starts_with(lower(course_code), lower($1))
              AND course_code NOT LIKE 'AY%'
            ORDER BY id
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(units)
    }

    async fn primary_organisation_of(&self, course_unit_id: &str) -> StoreResult<Option<String>> {
        let organisation = sqlx::query_scalar::<_, String>(
            r#"
            SELECT organisation_id FROM course_units_organisations
            WHERE course_unit_id = $1 AND type = 'PRIMARY'
            LIMIT 1
            "#,
        )
        .bind(course_unit_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organisation)
    }

    async fn existing_course_unit_ids(&self, ids: &[String]) -> StoreResult<HashSet<String>> {
        let found = sqlx::query_scalar::<_, String>("SELECT id FROM course_units WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn manually_enabled_realisation_ids(&self) -> StoreResult<HashSet<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM inactive_course_realisations WHERE manually_enabled",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn type_ids_with_edited_dates(&self, type_ids: &[String]) -> StoreResult<HashSet<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT type_id FROM feedback_targets
            WHERE feedback_dates_edited_by_teacher AND type_id = ANY($1)
            "#,
        )
        .bind(type_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn feedback_targets_of_realisations(
        &self,
        realisation_ids: &[String],
    ) -> StoreResult<Vec<FeedbackTargetRef>> {
        let targets = sqlx::query_as::<_, FeedbackTargetRef>(
            r#"
            SELECT id, course_realisation_id FROM feedback_targets
            WHERE course_realisation_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(realisation_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(targets)
    }

    async fn delete_teacher_rights_without_feedback(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_feedback_targets
            WHERE feedback_id IS NULL AND access_status <> $1
            "#,
        )
        .bind(AccessStatus::Student.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_student_assignments(&self, pairs: &[(String, i32)]) -> StoreResult<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let (user_ids, target_ids): (Vec<String>, Vec<i32>) = pairs.iter().cloned().unzip();

        let result = sqlx::query(
            r#"
            DELETE FROM user_feedback_targets u
            USING UNNEST($1::TEXT[], $2::INTEGER[]) AS p(user_id, feedback_target_id)
            WHERE u.user_id = p.user_id
              AND u.feedback_target_id = p.feedback_target_id
              AND u.access_status = $3
              AND NOT u.user_created
              AND NOT u.feedback_open_email_sent
              AND u.feedback_id IS NULL
            "#,
        )
        .bind(user_ids)
        .bind(target_ids)
        .bind(AccessStatus::Student.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn user_feedback_targets_of(&self, feedback_target_id: i32) -> StoreResult<Vec<UserFeedbackTarget>> {
        let rows = sqlx::query_as::<_, UserFeedbackTarget>(
            "SELECT * FROM user_feedback_targets WHERE feedback_target_id = $1 ORDER BY id",
        )
        .bind(feedback_target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn delete_user_feedback_targets(&self, ids: &[i64]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM user_feedback_targets WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_realisations_without_feedback(&self, ids: &[String]) -> StoreResult<CleanupReport> {
        let mut tx = self.pool.begin().await?;

        // Locked so no feedback lands between the check and the deletes.
        sqlx::query(
            "SELECT id FROM feedback_targets WHERE course_realisation_id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            SELECT u.id FROM user_feedback_targets u
            JOIN feedback_targets ft ON ft.id = u.feedback_target_id
            WHERE ft.course_realisation_id = ANY($1)
            ORDER BY u.id
            FOR UPDATE OF u
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        let deletable = sqlx::query_scalar::<_, String>(
            r#"
            SELECT cr.id FROM course_realisations cr
            WHERE cr.id = ANY($1)
              AND NOT EXISTS (
                SELECT 1 FROM feedback_targets ft
                JOIN user_feedback_targets u ON u.feedback_target_id = ft.id
                WHERE ft.course_realisation_id = cr.id AND u.feedback_id IS NOT NULL
              )
            ORDER BY cr.id
            FOR UPDATE
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = CleanupReport::default();
        if deletable.is_empty() {
            tx.commit().await?;
            return Ok(report);
        }

        let target_ids = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM feedback_targets WHERE course_realisation_id = ANY($1) ORDER BY id",
        )
        .bind(&deletable)
        .fetch_all(&mut *tx)
        .await?;

        for step in CascadeStep::ORDER {
            let rows = delete_cascade_step(&mut *tx, step, &target_ids, &deletable).await?;
            report.rows_deleted.push((step, rows));
        }

        tx.commit().await?;

        report.deleted_realisations = deletable;
        Ok(report)
    }

    async fn update_hidden_counts(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE feedback_targets ft
            SET hidden_count = COALESCE(counts.hidden, 0)
            FROM feedback_targets target
            LEFT JOIN (
                SELECT u.feedback_target_id AS id, COUNT(*)::INTEGER AS hidden
                FROM feedbacks f
                JOIN user_feedback_targets u ON u.feedback_id = f.id
                CROSS JOIN LATERAL jsonb_array_elements(
                    CASE WHEN jsonb_typeof(f.data) = 'array' THEN f.data ELSE '[]'::jsonb END
                ) AS answer
                WHERE answer ->> 'hidden' = 'true'
                GROUP BY u.feedback_target_id
            ) counts ON counts.id = target.id
            WHERE ft.id = target.id
              AND ft.hidden_count IS DISTINCT FROM COALESCE(counts.hidden, 0)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn interim_target_sets(&self) -> StoreResult<Vec<InterimTargetSet>> {
        let rows = sqlx::query_as::<_, InterimRow>(
            r#"
            SELECT original.course_realisation_id,
                   original.id AS original_target_id,
                   array_agg(interim.id ORDER BY interim.id) AS interim_target_ids
            FROM course_realisations cr
            JOIN feedback_targets original
              ON original.course_realisation_id = cr.id AND NOT original.user_created
            JOIN feedback_targets interim
              ON interim.course_realisation_id = cr.id AND interim.user_created
            WHERE NOT cr.user_created
            GROUP BY original.course_realisation_id, original.id
            ORDER BY original.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| InterimTargetSet {
                course_realisation_id: r.course_realisation_id,
                original_target_id: r.original_target_id,
                interim_target_ids: r.interim_target_ids,
            })
            .collect())
    }
}

/// One delete of the cancelled-realisation cascade.
async fn delete_cascade_step(
    conn: &mut PgConnection,
    step: CascadeStep,
    feedback_target_ids: &[i32],
    realisation_ids: &[String],
) -> StoreResult<u64> {
    let result = match step {
        CascadeStep::Assignments | CascadeStep::Logs | CascadeStep::Surveys | CascadeStep::Groups => {
            sqlx::query(&format!("DELETE FROM {step} WHERE feedback_target_id = ANY($1)"))
                .bind(feedback_target_ids)
                .execute(&mut *conn)
                .await?
        },
        CascadeStep::FeedbackTargets => {
            sqlx::query("DELETE FROM feedback_targets WHERE id = ANY($1)")
                .bind(feedback_target_ids)
                .execute(&mut *conn)
                .await?
        },
        CascadeStep::OrganisationLinks | CascadeStep::TagLinks => {
            sqlx::query(&format!("DELETE FROM {step} WHERE course_realisation_id = ANY($1)"))
                .bind(realisation_ids)
                .execute(&mut *conn)
                .await?
        },
        CascadeStep::Realisations => {
            sqlx::query("DELETE FROM course_realisations WHERE id = ANY($1)")
                .bind(realisation_ids)
                .execute(&mut *conn)
                .await?
        },
    };

    Ok(result.rows_affected())
}
