//! Route handlers for the reporting API. Each one offloads its database
//! work to `spawn_blocking`, since `db::Database` is a blocking
//! `std::sync::Mutex<rusqlite::Connection>` shared with the runner loop.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{queries, Database};
use crate::error::{DaemonError, Result};
use crate::models::{BenchmarkSuite, BenchmarkTask, RuntimeEnv};

use super::{AppState, MAX_OUTPUT_BYTES};

const DEFAULT_AUTHOR: &str = "web";

/// Run `f` against the shared connection on a blocking-pool thread.
async fn db_call<T, F>(db: Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || db.with_conn(f))
        .await
        .map_err(|e| DaemonError::Internal(anyhow::anyhow!("blocking task panicked: {e}")))?
}

fn resolve_author(headers: &HeaderMap) -> String {
    headers
        .get("AUTH_USER")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_AUTHOR)
        .to_string()
}

pub async fn list_suites(State(state): State<AppState>) -> Result<Json<Vec<BenchmarkSuite>>> {
    let suites = db_call(state.db, |conn| queries::list_suites(conn)).await?;
    Ok(Json(suites))
}

#[derive(Debug, Deserialize)]
pub struct CreateSuiteRequest {
    pub description: String,
    pub dockerfile: String,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    pub cpu_time_limit: i64,
    pub wall_clock_time_limit: i64,
    #[serde(default)]
    pub build_params: HashMap<String, String>,
    pub tasks: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSuiteResponse {
    pub id: i64,
}

pub async fn create_suite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSuiteRequest>,
) -> Result<Json<CreateSuiteResponse>> {
    let author = resolve_author(&headers);
    let id = db_call_mut(state.db, move |conn| {
        queries::create_suite(
            conn,
            &author,
            &req.description,
            &req.dockerfile,
            req.cpu_limit,
            req.memory_limit,
            req.cpu_time_limit,
            req.wall_clock_time_limit,
            &req.build_params,
            &req.tasks,
        )
    })
    .await?;
    Ok(Json(CreateSuiteResponse { id }))
}

/// Same as `db_call`, but for the mutating queries (`create_suite`,
/// `delete_suite`) that open their own transaction and need `&mut
/// Connection`. `Database::with_conn` only ever hands out `&Connection`, so
/// these take the lock directly rather than going through it.
async fn db_call_mut<T, F>(db: Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || db.with_conn_mut(f))
        .await
        .map_err(|e| DaemonError::Internal(anyhow::anyhow!("blocking task panicked: {e}")))?
}

pub async fn get_suite(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BenchmarkSuite>> {
    let suite = db_call(state.db, move |conn| queries::get_suite(conn, id)).await?;
    suite
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("suite {id}")))
}

#[derive(Debug, Serialize)]
pub struct SuiteResultsResponse {
    pub suite: BenchmarkSuite,
    pub env: RuntimeEnv,
    pub tasks: Vec<BenchmarkTask>,
    pub task_count: i64,
    pub assigned_count: i64,
    pub completed_count: i64,
}

pub async fn suite_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SuiteResultsResponse>> {
    db_call(state.db, move |conn| {
        let suite = queries::get_suite(conn, id)?.ok_or_else(|| DaemonError::NotFound(format!("suite {id}")))?;
        let env = queries::get_env_by_suite(conn, id)?.ok_or_else(|| DaemonError::NotFound(format!("env for suite {id}")))?;
        let tasks = queries::list_tasks_for_suite(conn, id)?;
        Ok(SuiteResultsResponse {
            task_count: queries::task_count(conn, id)?,
            assigned_count: queries::assigned_task_count(conn, id)?,
            completed_count: queries::completed_task_count(conn, id)?,
            suite,
            env,
            tasks,
        })
    })
    .await
    .map(Json)
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ok: bool,
}

pub async fn pause_suite(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<StatusResponse>> {
    db_call(state.db, move |conn| queries::pause_suite(conn, id)).await?;
    Ok(Json(StatusResponse { ok: true }))
}

pub async fn resume_suite(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<StatusResponse>> {
    db_call(state.db, move |conn| queries::resume_suite(conn, id)).await?;
    Ok(Json(StatusResponse { ok: true }))
}

pub async fn delete_suite(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<StatusResponse>> {
    db_call_mut(state.db, move |conn| queries::delete_suite(conn, id)).await?;
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: i64,
    pub suite_id: i64,
    pub command: String,
    pub state: String,
    pub assignee: Option<String>,
    pub exitcode: Option<i64>,
    pub build_output: Option<String>,
    pub build_output_truncated: bool,
    pub output: Option<String>,
    pub output_truncated: bool,
    pub stats: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

fn truncate(text: Option<String>) -> (Option<String>, bool) {
    match text {
        Some(text) if text.len() > MAX_OUTPUT_BYTES => {
            let cut = floor_char_boundary(&text, MAX_OUTPUT_BYTES);
            (Some(text[..cut].to_string()), true)
        }
        other => (other, false),
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

impl From<BenchmarkTask> for TaskResponse {
    fn from(task: BenchmarkTask) -> Self {
        let (output, output_truncated) = truncate(task.output);
        let (build_output, build_output_truncated) = truncate(task.build_output);
        Self {
            id: task.id,
            suite_id: task.suite_id,
            command: task.command,
            state: task.state.to_string(),
            assignee: task.assignee,
            exitcode: task.exitcode,
            build_output,
            build_output_truncated,
            output,
            output_truncated,
            stats: task.stats,
            result: task.result,
        }
    }
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskResponse>> {
    let task = db_call(state.db, move |conn| queries::get_task(conn, id)).await?;
    let task = task.ok_or_else(|| DaemonError::NotFound(format!("task {id}")))?;
    Ok(Json(TaskResponse::from(task)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskState;
    use axum::http::HeaderValue;

    fn sample_task(output: Option<String>, build_output: Option<String>) -> BenchmarkTask {
        BenchmarkTask {
            id: 7,
            suite_id: 3,
            command: "echo hi".to_string(),
            state: TaskState::Evaluated,
            assigned_at: None,
            updated_at: None,
            assignee: Some("runner-1".to_string()),
            exitcode: Some(0),
            build_output,
            output,
            stats: None,
            result: None,
        }
    }

    #[test]
    fn test_truncate_leaves_short_text_untouched() {
        let (text, truncated) = truncate(Some("hello".to_string()));
        assert_eq!(text, Some("hello".to_string()));
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_none_stays_none() {
        let (text, truncated) = truncate(None);
        assert_eq!(text, None);
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_cuts_long_text_at_the_byte_limit() {
        let long = "a".repeat(MAX_OUTPUT_BYTES + 100);
        let (text, truncated) = truncate(Some(long));
        assert!(truncated);
        assert_eq!(text.unwrap().len(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_truncate_never_splits_a_utf8_codepoint() {
        // Each char is 3 bytes; pad so the naive byte cut would land mid-char.
        let text = "€".repeat(MAX_OUTPUT_BYTES / 3 + 1) + "x";
        let (text, truncated) = truncate(Some(text));
        assert!(truncated);
        let text = text.unwrap();
        assert!(text.len() <= MAX_OUTPUT_BYTES);
        assert!(std::str::from_utf8(text.as_bytes()).is_ok());
    }

    #[test]
    fn test_task_response_maps_state_and_flags() {
        let task = sample_task(Some("out".to_string()), None);
        let response = TaskResponse::from(task);
        assert_eq!(response.id, 7);
        assert_eq!(response.state, "evaluated");
        assert_eq!(response.output, Some("out".to_string()));
        assert!(!response.output_truncated);
        assert_eq!(response.build_output, None);
        assert!(!response.build_output_truncated);
    }

    #[test]
    fn test_resolve_author_defaults_to_web() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_author(&headers), "web");
    }

    #[test]
    fn test_resolve_author_reads_auth_user_header() {
        let mut headers = HeaderMap::new();
        headers.insert("AUTH_USER", HeaderValue::from_static("alice"));
        assert_eq!(resolve_author(&headers), "alice");
    }
}
