//! Job orchestrator
//!
//! Owns the job run state machine. [`Orchestrator::run`] executes the six
//! stages for a fresh run; [`Orchestrator::start`] reconciles runs a dead
//! process left RUNNING, either resuming the single survivor or marking
//! every one INTERRUPTED.
//!
//! Two runs may overlap (a manual trigger racing the schedule). The
//! `job_runs` partial unique index rejects a second RUNNING row, but the
//! ad-hoc operations bypass job runs entirely and rely on idempotent writes.

use crate::db::StoreError;
use crate::updater::job_run::{JobRun, JobRunStore, JobStatus, NIGHTLY_JOB};
use crate::updater::offsets;
use crate::updater::pipeline::{Pipeline, RunContext, Stage, StageError, StageOutcome, StageReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use updater_common::alert;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' of run {run_id} failed: {source}")]
    Stage {
        run_id: Uuid,
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("Job run bookkeeping failed: {0}")]
    Jobs(#[source] StoreError),

    #[error("Failed to clear stream offsets: {0}")]
    Offsets(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    #[serde(flatten)]
    pub report: StageReport,
}

/// What a finished run did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub resumed: bool,
    pub stages: Vec<StageSummary>,
}

impl RunSummary {
    pub fn skipped_rows(&self) -> usize {
        self.stages.iter().map(|s| s.report.skipped.len()).sum()
    }
}

/// Result of startup recovery.
#[derive(Debug)]
pub enum Recovery {
    /// Nothing was left RUNNING
    Clean,
    Resumed(RunSummary),
    Interrupted(Vec<Uuid>),
}

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobRunStore>,
    resume_interrupted: bool,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, jobs: Arc<dyn JobRunStore>, resume_interrupted: bool) -> Self {
        Self {
            pipeline,
            jobs,
            resume_interrupted,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn jobs(&self) -> &Arc<dyn JobRunStore> {
        &self.jobs
    }

    /// Reconcile runs left RUNNING by a previous process.
    ///
    /// A single survivor is resumed when resumption is enabled: its offsets
    /// are kept, so completed streams finish after one empty page. Anything
    /// else is marked INTERRUPTED.
    pub async fn start(&self) -> Result<Recovery, PipelineError> {
        let running = self
            .jobs
            .list_by_status(JobStatus::Running)
            .await
            .map_err(PipelineError::Jobs)?;

        match running.as_slice() {
            [] => {
                info!("No interrupted job runs");
                Ok(Recovery::Clean)
            },
            [run] if self.resume_interrupted => {
                info!(run_id = %run.id, started_at = %run.started_at, "Resuming interrupted job run");
                self.execute(run.clone(), true).await.map(Recovery::Resumed)
            },
            runs => {
                if runs.len() > 1 {
                    warn!(count = runs.len(), "More than one job run was left RUNNING");
                }

                let mut interrupted = Vec::with_capacity(runs.len());
                for run in runs {
                    self.jobs
                        .finish(run.id, JobStatus::Interrupted, Some("process stopped while running"))
                        .await
                        .map_err(PipelineError::Jobs)?;
                    alert!(
                        run_id = %run.id,
                        job_type = %run.job_type,
                        started_at = %run.started_at,
                        "Job run was interrupted"
                    );
                    interrupted.push(run.id);
                }
                Ok(Recovery::Interrupted(interrupted))
            },
        }
    }

    /// Execute a fresh full run.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let run = self.begin_run().await?;
        self.complete_run(run).await
    }

    /// Take the run lease and clear every stream offset.
    ///
    /// Fails with [`StoreError::AlreadyRunning`] inside
    /// [`PipelineError::Jobs`] while another run holds the lease, before
    /// anything was touched.
    pub async fn begin_run(&self) -> Result<JobRun, PipelineError> {
        let run = self
            .jobs
            .create_running(NIGHTLY_JOB)
            .await
            .map_err(PipelineError::Jobs)?;
        info!(run_id = %run.id, "Job run started");

        match offsets::clear_all(self.pipeline.offsets()).await {
            Ok(cleared) => {
                info!(run_id = %run.id, cleared, "Stream offsets cleared");
                Ok(run)
            },
            Err(e) => {
                self.fail(&run, &e.to_string()).await;
                Err(PipelineError::Offsets(e))
            },
        }
    }

    /// Run every stage of a run returned by [`Orchestrator::begin_run`].
    pub async fn complete_run(&self, run: JobRun) -> Result<RunSummary, PipelineError> {
        self.execute(run, false).await
    }

    async fn execute(&self, run: JobRun, resumed: bool) -> Result<RunSummary, PipelineError> {
        let ctx = RunContext::for_run(&run);
        let mut summary = RunSummary {
            run_id: run.id,
            started_at: run.started_at,
            resumed,
            stages: Vec::with_capacity(Stage::PIPELINE.len()),
        };

        for stage in Stage::PIPELINE {
            let report = match StageOutcome::from(self.pipeline.run_stage(stage, &ctx).await) {
                StageOutcome::Success(report) => report,
                StageOutcome::PartialFailure(report) => {
                    warn!(
                        run_id = %run.id,
                        stage = %stage,
                        skipped = report.skipped.len(),
                        "Stage finished with skipped rows"
                    );
                    report
                },
                StageOutcome::Fatal(source) => {
                    let message = format!("{stage}: {source}");
                    self.fail(&run, &message).await;
                    return Err(PipelineError::Stage {
                        run_id: run.id,
                        stage,
                        source,
                    });
                },
            };
            summary.stages.push(StageSummary { stage, report });
        }

        self.jobs
            .finish(run.id, JobStatus::Finished, None)
            .await
            .map_err(PipelineError::Jobs)?;

        info!(
            run_id = %run.id,
            resumed,
            skipped = summary.skipped_rows(),
            "Job run finished"
        );
        Ok(summary)
    }

    /// Mark `run` FAILURE and raise an alert. Bookkeeping errors are logged
    /// so the original failure stays the one reported.
    async fn fail(&self, run: &JobRun, message: &str) {
        alert!(run_id = %run.id, error = %message, "Job run failed");

        if let Err(e) = self.jobs.finish(run.id, JobStatus::Failure, Some(message)).await {
            alert!(run_id = %run.id, error = %e, "Failed to mark job run as FAILURE");
        }
    }
}
