//! Updater routes

use super::AppState;
use crate::error::AppError;
use crate::updater::job_run::{JobRun, JobStatus};
use crate::updater::pipeline::StageReport;
use crate::updater::reconcile::cleanup::CleanupReport;
use crate::updater::scheduler::log_run_result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_JOB_RUN_LIMIT: i64 = 20;
const MAX_JOB_RUN_LIMIT: i64 = 500;

pub fn updater_routes() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/run", post(run))
        .route("/enrolments/:realisation_id", post(update_realisation_enrolments))
        .route("/enrolments-new", post(update_new_enrolments))
        .route("/cancelled-realisations/purge", post(purge_cancelled_realisations))
        .route("/job-runs", get(list_job_runs))
}

async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// Start a full run in the background
///
/// POST /run
///
/// Takes the run lease before responding; a held lease is a 409.
async fn run(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let run = state.orchestrator.begin_run().await?;
    let run_id = run.id;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move { log_run_result(orchestrator.complete_run(run).await) });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "started", "run_id": run_id })),
    ))
}

/// POST /enrolments/:realisation_id
async fn update_realisation_enrolments(
    State(state): State<AppState>,
    Path(realisation_id): Path<String>,
) -> Result<Json<StageReport>, AppError> {
    let report = state
        .orchestrator
        .pipeline()
        .update_enrolments_of_realisation(&realisation_id)
        .await?;
    Ok(Json(report))
}

/// POST /enrolments-new
async fn update_new_enrolments(State(state): State<AppState>) -> Result<Json<StageReport>, AppError> {
    let report = state.orchestrator.pipeline().update_new_enrolments().await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub realisation_ids: Vec<String>,
}

/// POST /cancelled-realisations/purge
///
/// Realisations that received feedback are reported as kept.
async fn purge_cancelled_realisations(
    State(state): State<AppState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<CleanupReport>, AppError> {
    if request.realisation_ids.is_empty() {
        return Err(AppError::BadRequest("realisationIds must not be empty".to_string()));
    }

    let report = state
        .orchestrator
        .pipeline()
        .purge_cancelled_realisations(&request.realisation_ids)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct JobRunsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobRunsResponse {
    pub job_runs: Vec<JobRun>,
}

/// GET /job-runs?status=RUNNING&limit=20
async fn list_job_runs(
    State(state): State<AppState>,
    Query(query): Query<JobRunsQuery>,
) -> Result<Json<JobRunsResponse>, AppError> {
    let jobs = state.orchestrator.jobs();

    let job_runs = match query.status {
        Some(status) => {
            let status: JobStatus = status
                .parse()
                .map_err(|_| AppError::BadRequest(format!("Unknown job status '{status}'")))?;
            jobs.list_by_status(status).await?
        },
        None => {
            let limit = query
                .limit
                .unwrap_or(DEFAULT_JOB_RUN_LIMIT)
                .clamp(1, MAX_JOB_RUN_LIMIT);
            jobs.latest(limit).await?
        },
    };

    Ok(Json(JobRunsResponse { job_runs }))
}
