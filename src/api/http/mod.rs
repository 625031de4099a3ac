//! Reporting HTTP API: a thin read/write surface over the same database the
//! runner loop writes to. Built the way `router::build_router` composes
//! routes — nesting, `TraceLayer`, `CorsLayer` — but exposing suite/task
//! reporting routes instead of server management.

mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::Database;

/// Output fields (`output`, `build_output`) are capped at this many bytes in
/// `GET /api/tasks/{id}`; the full text is available in the database, but the
/// API never ships more than this in one response.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/suites", get(handlers::list_suites).post(handlers::create_suite))
        .route("/suites/:id", get(handlers::get_suite))
        .route("/suites/:id/results", get(handlers::suite_results))
        .route("/suites/:id/pause", post(handlers::pause_suite))
        .route("/suites/:id/resume", post(handlers::resume_suite))
        .route("/suites/:id/delete", post(handlers::delete_suite))
        .route("/tasks/:id", get(handlers::get_task));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
