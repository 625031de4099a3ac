//! Query functions against the task/suite/env tables.
//!
//! Every function takes a `&Connection` directly rather than wrapping one,
//! so callers compose them inside a single `Database::with_conn` closure
//! when a sequence needs to share one transaction.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{DaemonError, Result};
use crate::models::{BenchmarkSuite, BenchmarkTask, RuntimeEnv, TaskState, TaskStats};

fn row_to_suite(row: &Row) -> rusqlite::Result<BenchmarkSuite> {
    let created_at: String = row.get("created_at")?;
    Ok(BenchmarkSuite {
        id: row.get("id")?,
        created_at: created_at
            .parse()
            .unwrap_or_else(|_| Utc::now()),
        author: row.get("author")?,
        description: row.get("description")?,
    })
}

fn row_to_env(row: &Row) -> rusqlite::Result<RuntimeEnv> {
    Ok(RuntimeEnv {
        id: row.get("id")?,
        suite_id: row.get("suite_id")?,
        dockerfile: row.get("dockerfile")?,
        params: HashMap::new(),
        cpu_limit: row.get("cpu_limit")?,
        memory_limit: row.get("memory_limit")?,
        cpu_time_limit: row.get("cpu_time_limit")?,
        wall_clock_time_limit: row.get("wall_clock_time_limit")?,
    })
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| s.parse().ok())
}

fn row_to_task(row: &Row) -> rusqlite::Result<BenchmarkTask> {
    let state: i64 = row.get("state")?;
    let stats: Option<String> = row.get("stats")?;
    let result: Option<String> = row.get("result")?;
    Ok(BenchmarkTask {
        id: row.get("id")?,
        suite_id: row.get("suite_id")?,
        command: row.get("command")?,
        state: TaskState::from_i64(state).unwrap_or(TaskState::Cancelled),
        assigned_at: parse_ts(row.get("assigned_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
        assignee: row.get("assignee")?,
        exitcode: row.get("exitcode")?,
        build_output: row.get("build_output")?,
        output: row.get("output")?,
        stats: stats.and_then(|s| serde_json::from_str(&s).ok()),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

pub fn params_for_env(conn: &Connection, env_id: i64) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM runtime_param WHERE env_id = ?1")?;
    let rows = stmt.query_map(params![env_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Create a suite, its env, params, and initial `pending` tasks in one go.
#[allow(clippy::too_many_arguments)]
pub fn create_suite(
    conn: &mut Connection,
    author: &str,
    description: &str,
    dockerfile: &str,
    cpu_limit: i64,
    memory_limit: i64,
    cpu_time_limit: i64,
    wall_clock_time_limit: i64,
    build_params: &HashMap<String, String>,
    tasks: &[String],
) -> Result<i64> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO benchmark_suite (created_at, author, description) VALUES (?1, ?2, ?3)",
        params![now, author, description],
    )?;
    let suite_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO runtime_env
            (suite_id, dockerfile, cpu_limit, memory_limit, cpu_time_limit, wall_clock_time_limit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            suite_id,
            dockerfile,
            cpu_limit,
            memory_limit,
            cpu_time_limit,
            wall_clock_time_limit
        ],
    )?;
    let env_id = tx.last_insert_rowid();

    for (k, v) in build_params {
        tx.execute(
            "INSERT INTO runtime_param (env_id, key, value) VALUES (?1, ?2, ?3)",
            params![env_id, k, v],
        )?;
    }

    for command in tasks {
        tx.execute(
            "INSERT INTO benchmark_task (suite_id, command, state) VALUES (?1, ?2, ?3)",
            params![suite_id, command, TaskState::Pending.as_i64()],
        )?;
    }

    tx.commit()?;
    Ok(suite_id)
}

pub fn list_suites(conn: &Connection) -> Result<Vec<BenchmarkSuite>> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at, author, description FROM benchmark_suite ORDER BY id",
    )?;
    let rows = stmt.query_map([], row_to_suite)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_suite(conn: &Connection, id: i64) -> Result<Option<BenchmarkSuite>> {
    conn.query_row(
        "SELECT id, created_at, author, description FROM benchmark_suite WHERE id = ?1",
        params![id],
        row_to_suite,
    )
    .optional()
    .map_err(DaemonError::from)
}

pub fn get_env_by_suite(conn: &Connection, suite_id: i64) -> Result<Option<RuntimeEnv>> {
    let env = conn
        .query_row(
            "SELECT id, suite_id, dockerfile, cpu_limit, memory_limit, cpu_time_limit,
                    wall_clock_time_limit
             FROM runtime_env WHERE suite_id = ?1",
            params![suite_id],
            row_to_env,
        )
        .optional()?;
    match env {
        Some(mut env) => {
            env.params = params_for_env(conn, env.id)?;
            Ok(Some(env))
        }
        None => Ok(None),
    }
}

pub fn get_env(conn: &Connection, env_id: i64) -> Result<Option<RuntimeEnv>> {
    let env = conn
        .query_row(
            "SELECT id, suite_id, dockerfile, cpu_limit, memory_limit, cpu_time_limit,
                    wall_clock_time_limit
             FROM runtime_env WHERE id = ?1",
            params![env_id],
            row_to_env,
        )
        .optional()?;
    match env {
        Some(mut env) => {
            env.params = params_for_env(conn, env.id)?;
            Ok(Some(env))
        }
        None => Ok(None),
    }
}

pub fn list_tasks_for_suite(conn: &Connection, suite_id: i64) -> Result<Vec<BenchmarkTask>> {
    let mut stmt = conn.prepare(
        "SELECT id, suite_id, command, state, assigned_at, updated_at, assignee, exitcode,
                build_output, output, stats, result
         FROM benchmark_task WHERE suite_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![suite_id], row_to_task)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_task(conn: &Connection, id: i64) -> Result<Option<BenchmarkTask>> {
    conn.query_row(
        "SELECT id, suite_id, command, state, assigned_at, updated_at, assignee, exitcode,
                build_output, output, stats, result
         FROM benchmark_task WHERE id = ?1",
        params![id],
        row_to_task,
    )
    .optional()
    .map_err(DaemonError::from)
}

pub fn task_count(conn: &Connection, suite_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM benchmark_task WHERE suite_id = ?1",
        params![suite_id],
        |r| r.get(0),
    )?)
}

pub fn assigned_task_count(conn: &Connection, suite_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM benchmark_task WHERE suite_id = ?1 AND state = ?2",
        params![suite_id, TaskState::Assigned.as_i64()],
        |r| r.get(0),
    )?)
}

pub fn completed_task_count(conn: &Connection, suite_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM benchmark_task WHERE suite_id = ?1 AND state = ?2",
        params![suite_id, TaskState::Evaluated.as_i64()],
        |r| r.get(0),
    )?)
}

/// `pending -> created` for every task in this suite.
pub fn pause_suite(conn: &Connection, suite_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE benchmark_task SET state = ?1 WHERE suite_id = ?2 AND state = ?3",
        params![
            TaskState::Created.as_i64(),
            suite_id,
            TaskState::Pending.as_i64()
        ],
    )?;
    Ok(())
}

/// `created -> pending` for every task in this suite.
pub fn resume_suite(conn: &Connection, suite_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE benchmark_task SET state = ?1 WHERE suite_id = ?2 AND state = ?3",
        params![
            TaskState::Pending.as_i64(),
            suite_id,
            TaskState::Created.as_i64()
        ],
    )?;
    Ok(())
}

/// Cascade delete tasks, params, env, then suite. Raw deletes, not a foreign
/// key cascade — there is no migration layer to add one to.
pub fn delete_suite(conn: &mut Connection, suite_id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM benchmark_task WHERE suite_id = ?1",
        params![suite_id],
    )?;
    tx.execute(
        "DELETE FROM runtime_param WHERE env_id IN
            (SELECT id FROM runtime_env WHERE suite_id = ?1)",
        params![suite_id],
    )?;
    tx.execute(
        "DELETE FROM runtime_env WHERE suite_id = ?1",
        params![suite_id],
    )?;
    tx.execute(
        "DELETE FROM benchmark_suite WHERE id = ?1",
        params![suite_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// The single task-acquisition query. Restricted to envs whose limits
/// fit the caller's available resources; first a `pending` task by ascending
/// id, else a stale `assigned` task (abandoned work) by ascending id.
pub fn fetch_runnable(
    conn: &Connection,
    available_cores: i64,
    available_memory: i64,
    reclaim_minutes: i64,
) -> Result<Option<i64>> {
    let pending: Option<i64> = conn
        .query_row(
            "SELECT t.id
             FROM benchmark_task t
             JOIN runtime_env e ON e.suite_id = t.suite_id
             WHERE t.state = ?1
               AND e.cpu_limit <= ?2
               AND e.memory_limit <= ?3
             ORDER BY t.id ASC
             LIMIT 1",
            params![TaskState::Pending.as_i64(), available_cores, available_memory],
            |r| r.get(0),
        )
        .optional()?;

    if pending.is_some() {
        return Ok(pending);
    }

    let cutoff = (Utc::now() - Duration::minutes(reclaim_minutes)).to_rfc3339();
    let reclaimed: Option<i64> = conn
        .query_row(
            "SELECT t.id
             FROM benchmark_task t
             JOIN runtime_env e ON e.suite_id = t.suite_id
             WHERE t.state = ?1
               AND e.cpu_limit <= ?2
               AND e.memory_limit <= ?3
               AND t.updated_at <= ?4
             ORDER BY t.id ASC
             LIMIT 1",
            params![
                TaskState::Assigned.as_i64(),
                available_cores,
                available_memory,
                cutoff
            ],
            |r| r.get(0),
        )
        .optional()?;

    Ok(reclaimed)
}

/// `pending -> assigned`, setting assignee/assignedAt/updatedAt. Returns
/// `false` (without raising) if another runner already claimed the row.
pub fn acquire(conn: &Connection, task_id: i64, runner_id: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE benchmark_task
         SET state = ?1, assignee = ?2, assigned_at = ?3, updated_at = ?3
         WHERE id = ?4 AND state IN (?5, ?6)",
        params![
            TaskState::Assigned.as_i64(),
            runner_id,
            now,
            task_id,
            TaskState::Pending.as_i64(),
            TaskState::Assigned.as_i64(),
        ],
    )?;
    Ok(updated > 0)
}

/// `assigned -> pending`, nulling assignee/assignedAt/updatedAt.
pub fn abandon(conn: &Connection, task_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE benchmark_task
         SET state = ?1, assignee = NULL, assigned_at = NULL, updated_at = NULL
         WHERE id = ?2",
        params![TaskState::Pending.as_i64(), task_id],
    )?;
    Ok(())
}

/// Refresh `updatedAt` and optionally stream partial output, without
/// changing state. Used by both the environment-build wait loop and the
/// run-and-watch loop.
pub fn poke(conn: &Connection, task_id: i64, output: Option<&str>) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    match output {
        Some(output) => conn.execute(
            "UPDATE benchmark_task SET updated_at = ?1, output = ?2 WHERE id = ?3",
            params![now, output, task_id],
        )?,
        None => conn.execute(
            "UPDATE benchmark_task SET updated_at = ?1 WHERE id = ?2",
            params![now, task_id],
        )?,
    };
    Ok(())
}

/// Refresh `updatedAt` and stream partial build output during image builds.
pub fn build_poke(conn: &Connection, task_id: i64, build_output: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE benchmark_task SET updated_at = ?1, build_output = ?2 WHERE id = ?3",
        params![now, build_output, task_id],
    )?;
    Ok(())
}

/// `assigned -> evaluated`, writing the terminal fields. Only place these
/// columns are written.
pub fn finish(
    conn: &Connection,
    task_id: i64,
    exitcode: i64,
    output: &str,
    stats: Option<&TaskStats>,
    result: Option<&serde_json::Value>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let stats_json = stats.map(|s| serde_json::to_string(s)).transpose()?;
    let result_json = result.map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE benchmark_task
         SET state = ?1, exitcode = ?2, output = ?3, stats = ?4, result = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            TaskState::Evaluated.as_i64(),
            exitcode,
            output,
            stats_json,
            result_json,
            now,
            task_id
        ],
    )?;
    Ok(())
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Internal(anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_acquire_fifo_and_abandon() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::schema::SCHEMA).unwrap();

        let _suite_id = create_suite(
            &mut conn,
            "web",
            "desc",
            "FROM alpine",
            1,
            1024 * 1024,
            60,
            60,
            &HashMap::new(),
            &["echo a".into(), "echo b".into()],
        )
        .unwrap();

        let runnable = fetch_runnable(&conn, 4, 1024 * 1024 * 1024, 5).unwrap();
        assert!(runnable.is_some());
        let first_id = runnable.unwrap();

        let ok = acquire(&conn, first_id, "runner-1").unwrap();
        assert!(ok);

        let task = get_task(&conn, first_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.assignee.as_deref(), Some("runner-1"));
        assert!(task.assigned_at.is_some());

        // FIFO: the next runnable task should be the second one now.
        let next = fetch_runnable(&conn, 4, 1024 * 1024 * 1024, 5).unwrap().unwrap();
        assert_ne!(next, first_id);

        abandon(&conn, first_id).unwrap();
        let task = get_task(&conn, first_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.assignee.is_none());
        assert!(task.assigned_at.is_none());
        assert!(task.updated_at.is_none());
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::schema::SCHEMA).unwrap();
        let suite_id = create_suite(
            &mut conn,
            "web",
            "desc",
            "FROM alpine",
            1,
            1024,
            60,
            60,
            &HashMap::new(),
            &["echo a".into()],
        )
        .unwrap();

        pause_suite(&conn, suite_id).unwrap();
        let tasks = list_tasks_for_suite(&conn, suite_id).unwrap();
        assert!(tasks.iter().all(|t| t.state == TaskState::Created));

        resume_suite(&conn, suite_id).unwrap();
        let tasks = list_tasks_for_suite(&conn, suite_id).unwrap();
        assert!(tasks.iter().all(|t| t.state == TaskState::Pending));
    }

    #[test]
    fn test_reclamation_of_stale_assigned() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::schema::SCHEMA).unwrap();
        let suite_id = create_suite(
            &mut conn,
            "web",
            "desc",
            "FROM alpine",
            1,
            1024,
            60,
            60,
            &HashMap::new(),
            &["echo a".into()],
        )
        .unwrap();
        let task_id = fetch_runnable(&conn, 4, 1024 * 1024, 5).unwrap().unwrap();
        acquire(&conn, task_id, "runner-1").unwrap();

        let stale = (Utc::now() - Duration::minutes(10)).to_rfc3339();
        conn.execute(
            "UPDATE benchmark_task SET updated_at = ?1 WHERE id = ?2",
            params![stale, task_id],
        )
        .unwrap();

        let reclaimable = fetch_runnable(&conn, 4, 1024 * 1024, 5).unwrap();
        assert_eq!(reclaimable, Some(task_id));

        let _ = suite_id;
    }
}
