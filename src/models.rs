//! Data model: BenchmarkSuite, RuntimeEnv, BenchmarkTask.
//!
//! Shapes mirror the relational schema in `db::schema`; these are plain
//! value structs hydrated from `rusqlite::Row`s, not an ORM.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle state. Numeric values match the original schema's integer
/// encoding so an existing database can be read without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum TaskState {
    Created = 1,
    Pending = 2,
    Assigned = 3,
    Evaluated = 4,
    Cancelled = 5,
}

impl TaskState {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(TaskState::Created),
            2 => Some(TaskState::Pending),
            3 => Some(TaskState::Assigned),
            4 => Some(TaskState::Evaluated),
            5 => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Evaluated => "evaluated",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSuite {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEnv {
    pub id: i64,
    pub suite_id: i64,
    pub dockerfile: String,
    pub params: HashMap<String, String>,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    pub cpu_time_limit: i64,
    pub wall_clock_time_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkTask {
    pub id: i64,
    pub suite_id: i64,
    pub command: String,
    pub state: TaskState,
    pub assigned_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub exitcode: Option<i64>,
    pub build_output: Option<String>,
    pub output: Option<String>,
    /// Opaque structured blob, stored as JSON text.
    pub stats: Option<serde_json::Value>,
    /// Opaque structured blob extracted from the container, stored as JSON text.
    pub result: Option<serde_json::Value>,
}

/// Stats derived by the run-and-watch loop and persisted on `finish`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub cpu_time: i64,
    pub user_time: i64,
    pub system_time: i64,
    pub wall_time: i64,
    pub out_of_memory: bool,
    pub timeout: bool,
    pub mem_stat: HashMap<String, i64>,
    pub mem_usage: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artefact_error: Option<String>,
}
