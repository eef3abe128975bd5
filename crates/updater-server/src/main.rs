//! Updater Server - Main entry point

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{error, info};
use updater_common::logging::{init_logging, LogConfig};

use updater_server::{
    api::{self, AppState},
    config::Config,
    db,
    store::PgStore,
    updater::{
        importer::ImporterClient,
        job_run::PgJobRunStore,
        offsets::PgOffsetStore,
        reconcile::similarity::NormalizedLevenshtein,
        scheduler::{run_nightly, Scheduler},
        Orchestrator, Pipeline, PipelineSettings,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("updater-server")
        .filter_directives("updater_server=debug,tower_http=info,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);
    let _log_guard = init_logging(&log_config)?;

    info!("Starting updater server");

    let config = Config::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        importer = %config.importer.url,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database).await?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database migrations completed");

    let importer = ImporterClient::new(
        &config.importer.url,
        &config.importer.token,
        Duration::from_secs(config.importer.timeout_secs),
    )
    .context("Failed to build importer client")?;

    let pipeline = Pipeline::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(PgOffsetStore::new(pool.clone())),
        Arc::new(importer),
        Arc::new(NormalizedLevenshtein),
        PipelineSettings::from(&config.updater),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(pipeline),
        Arc::new(PgJobRunStore::new(pool)),
        config.updater.resume_interrupted,
    ));

    let _background = if config.updater.enabled {
        Some(start_updater(orchestrator.clone(), &config)?)
    } else {
        info!("Updater is disabled (UPDATER_ENABLED=false)");
        None
    };

    let app = api::create_router(AppState { orchestrator });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Startup recovery, then the cron triggers and the optional startup run.
fn start_updater(orchestrator: Arc<Orchestrator>, config: &Config) -> Result<tokio::task::JoinHandle<()>> {
    let scheduler = Scheduler::new(orchestrator.clone(), &config.updater)?;
    let run_on_startup = config.updater.run_on_startup;

    info!(
        cron = %config.updater.cron,
        enrolments_cron = %config.updater.enrolments_cron,
        "Updater scheduled"
    );

    Ok(tokio::spawn(async move {
        let schedules = scheduler.start().await;

        if run_on_startup {
            run_nightly(&orchestrator).await;
        }

        for handle in schedules {
            if let Err(e) = handle.await {
                error!(error = %e, "Schedule task stopped");
            }
        }
    }))
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!(timeout_secs, "Waiting for connections to close");
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
