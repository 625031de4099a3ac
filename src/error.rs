//! Crate-wide error type.
//!
//! Mirrors the error taxonomy from the runner's design: a handful of
//! domain-specific variants that the Task Supervisor converts into a
//! finished/abandoned task, plus the ambient infrastructure variants the
//! config loader, database layer, and HTTP surface need.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Resource Manager admission failure: the named counter has insufficient
    /// capacity for this request. Local to the caller; never finishes a task.
    #[error("not enough resources available: {0}")]
    NotEnoughResources(String),

    /// A container-driver subprocess exited non-zero. Carries captured
    /// stdout+stderr.
    #[error("container engine error: {0}")]
    Engine(String),

    /// Image build failed. Surfaced to the supervisor via the build result;
    /// results in the task finishing with exitcode=1 and the log as output.
    #[error("environment build failed: {0}")]
    EnvironmentBuild(String),

    /// Container create/start/stop failed. Same supervisor-level handling as
    /// `EnvironmentBuild`.
    #[error("task run failed: {0}")]
    TaskRun(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DaemonError::NotEnoughResources(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": true,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
