//! Cron triggers for the nightly run and the new-enrolments refresh
//!
//! Expressions are evaluated in Helsinki time. Five-field expressions get a
//! seconds field prepended, as the `cron` crate expects six or seven.

use crate::config::UpdaterConfig;
use crate::db::StoreError;
use crate::updater::orchestrator::{Orchestrator, PipelineError, Recovery, RunSummary};
use chrono::{DateTime, Utc};
use chrono_tz::Europe::Helsinki;
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
}

pub fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|source| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        source,
    })
}

/// First fire time of `schedule` strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&Helsinki))
        .next()
        .map(|at| at.with_timezone(&Utc))
}

/// Run `job` at every fire time of `schedule` until the task is aborted.
///
/// Jobs never overlap with themselves: the next fire time is computed after
/// the previous job returned.
pub fn spawn_schedule<F, Fut>(name: &'static str, schedule: Schedule, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut last_fire: Option<DateTime<Utc>> = None;

        loop {
            let now = Utc::now();
            let from = last_fire.map_or(now, |last| last.max(now));
            let Some(next) = next_fire(&schedule, from) else {
                warn!(job = name, "Schedule has no upcoming fire time, stopping");
                break;
            };

            info!(job = name, next = %next, "Next scheduled run");
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            info!(job = name, "Scheduled job firing");
            job().await;
            last_fire = Some(next);
        }
    })
}

/// Both cron triggers of the updater.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    nightly: Schedule,
    enrolments: Schedule,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &UpdaterConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            orchestrator,
            nightly: parse_schedule(&config.cron)?,
            enrolments: parse_schedule(&config.enrolments_cron)?,
        })
    }

    /// Settle runs a previous process left RUNNING, then install the
    /// triggers. A scheduled run never races the resumption of an
    /// interrupted one.
    pub async fn start(self) -> Vec<JoinHandle<()>> {
        match self.orchestrator.start().await {
            Ok(Recovery::Clean) => {},
            Ok(Recovery::Resumed(summary)) => info!(run_id = %summary.run_id, "Interrupted run resumed"),
            Ok(Recovery::Interrupted(ids)) => info!(count = ids.len(), "Interrupted runs marked"),
            Err(e) => error!(error = %e, "Startup recovery failed"),
        }

        self.spawn()
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let nightly = {
            let orchestrator = self.orchestrator.clone();
            spawn_schedule("nightly", self.nightly, move || {
                let orchestrator = orchestrator.clone();
                async move { run_nightly(&orchestrator).await }
            })
        };

        let enrolments = {
            let orchestrator = self.orchestrator;
            spawn_schedule("new-enrolments", self.enrolments, move || {
                let orchestrator = orchestrator.clone();
                async move {
                    match orchestrator.pipeline().update_new_enrolments().await {
                        Ok(report) => info!(skipped = report.skipped.len(), "New enrolments refreshed"),
                        Err(e) => error!(error = %e, "New enrolments refresh failed"),
                    }
                }
            })
        };

        vec![nightly, enrolments]
    }
}

/// One scheduled full run. Failures were already alerted by the orchestrator.
pub async fn run_nightly(orchestrator: &Orchestrator) {
    log_run_result(orchestrator.run().await);
}

/// Log how a full run ended.
pub fn log_run_result(result: Result<RunSummary, PipelineError>) {
    match result {
        Ok(summary) => info!(
            run_id = %summary.run_id,
            skipped = summary.skipped_rows(),
            "Full run finished"
        ),
        Err(PipelineError::Jobs(StoreError::AlreadyRunning(job_type))) => {
            warn!(job_type = %job_type, "Another run is in progress, skipping this one")
        },
        Err(e) => error!(error = %e, "Full run failed"),
    }
}
