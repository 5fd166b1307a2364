//! Deploy Service
//!
//! Turns generated source files into running, publicly routed, paid API
//! containers and keeps the registry and the container engine in agreement.

pub mod config;
pub mod handlers;
pub mod locks;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod reconciler;
pub mod tester;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use handlers::AppState;
pub use locks::ResourceLocks;
pub use notifier::{HttpNotifier, NoopNotifier, Notifier, StatusQueue, StatusUpdate};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use tester::{PostDeployTester, Stage, StageResult, TestSuiteReport, TesterConfig};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/api/resources",
            get(handlers::list_resources_handler).post(handlers::deploy_handler),
        )
        .route(
            "/api/resources/{id}",
            get(handlers::get_resource_handler)
                .put(handlers::redeploy_handler)
                .delete(handlers::remove_handler),
        )
        .route("/api/resources/{id}/stop", post(handlers::stop_handler))
        .route("/api/resources/{id}/restart", post(handlers::restart_handler))
        .route("/api/resources/{id}/logs", get(handlers::logs_handler))
        .route("/api/resources/{id}/events", get(handlers::events_handler))
        .route("/api/resources/{id}/test", post(handlers::test_handler))
        .route("/api/resources/{id}/counters", post(handlers::counters_handler))
        .route("/api/reconcile", post(handlers::reconcile_handler))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
