//! HTTP front door
//!
//! Thin triggers over the orchestrator and the pipeline's ad-hoc operations.
//! Nothing here reconciles data itself.

pub mod routes;


use crate::middleware;
use crate::updater::Orchestrator;
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    routes::updater_routes()
        .with_state(state)
        .layer(middleware::tracing_layer())
}
