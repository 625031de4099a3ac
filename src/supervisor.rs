//! Task Supervisor: per-task state machine. claim -> obtain image -> create
//! container under a per-task cgroup subtree -> run and watch -> collect
//! stats and artifact -> commit outcome.

use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use scopeguard::ScopeGuard;
use tracing::{error, info, warn};

use crate::cgroup::Handle as CgroupHandle;
use crate::db::{queries, Database};
use crate::driver::{BindMount, Driver, ResourceLimits};
use crate::environment;
use crate::error::{DaemonError, Result};
use crate::models::{RuntimeEnv, TaskStats};

/// Everything a supervisor needs that is shared across every task running on
/// this runner. Passed explicitly rather than kept as process-wide globals.
pub struct Context {
    pub db: Arc<Database>,
    pub driver: Arc<Driver>,
    pub env_manager: Arc<environment::Manager>,
    pub notify_interval: u32,
}

const OBTAIN_ENV_POLL_SECS: u64 = 20;
const RUN_POLL_SECS: u64 = 1;
const STOP_GRACE_SECS: u32 = 1;

/// Entry point: `evaluateTask(taskId, envManager, runnerCgroup)`.
///
/// On `EnvironmentBuildError`/`TaskRunError`, the task is finished with
/// exitcode=1 and the error text as output. Any other error abandons the
/// task (state -> pending, null assignee/timestamps) and is re-raised so the
/// caller's worker thread can log it and exit.
pub fn evaluate_task(ctx: &Context, task_id: i64, runner_cgroup: &CgroupHandle) -> Result<()> {
    let outcome = run_task(ctx, task_id, runner_cgroup);

    match outcome {
        Ok(()) => Ok(()),
        Err(e @ (DaemonError::EnvironmentBuild(_) | DaemonError::TaskRun(_))) => {
            warn!(task_id, error = %e, "task failed, finishing with synthetic exit code");
            ctx.db
                .with_conn(|conn| queries::finish(conn, task_id, 1, &e.to_string(), None, None))?;
            Ok(())
        }
        Err(e) => {
            error!(task_id, error = %e, "unexpected error, abandoning task");
            ctx.db.with_conn(|conn| queries::abandon(conn, task_id))?;
            Err(e)
        }
    }
}

fn run_task(ctx: &Context, task_id: i64, runner_cgroup: &CgroupHandle) -> Result<()> {
    let task = ctx
        .db
        .with_conn(|conn| queries::get_task(conn, task_id))?
        .ok_or_else(|| DaemonError::NotFound(format!("task {task_id}")))?;

    let env = ctx
        .db
        .with_conn(|conn| queries::get_env_by_suite(conn, task.suite_id))?
        .ok_or_else(|| DaemonError::NotFound(format!("env for suite {}", task.suite_id)))?;

    let image = obtain_environment(ctx, task_id, &env)?;

    // A supervising group `task{id}` (measurement), and inside
    // it a leaf `benchmark` with no controllers delegated, so an OOM kill
    // inside the container does not also reap the supervisor. `task_group` is
    // guarded the instant it exists, so a failure creating `benchmark_group`
    // still releases it rather than leaking its cgroup directory.
    let task_group = runner_cgroup
        .new_group(&format!("task{task_id}"), &["cpu", "memory"])
        .map_err(|e| DaemonError::Cgroup(e.to_string()))?;
    let task_group = scopeguard::guard(task_group, |mut task| task.release());

    let benchmark_group = task_group
        .new_group("benchmark", &[])
        .map_err(|e| DaemonError::Cgroup(e.to_string()))?;

    let groups = scopeguard::guard((ScopeGuard::into_inner(task_group), benchmark_group), |(mut task, mut bench)| {
        bench.release();
        task.release();
    });

    let artefact_dir = tempfile::tempdir().map_err(DaemonError::Io)?;

    let container_name = unique_container_name(&ctx.driver, task_id)?;
    let command = shell_words::split(&task.command)
        .map_err(|e| DaemonError::TaskRun(format!("invalid command: {e}")))?;
    let limits = ResourceLimits {
        cpu_limit: Some(env.cpu_limit),
        memory_limit: Some(env.memory_limit),
    };
    let mounts = [BindMount {
        source: artefact_dir.path().display().to_string(),
        target: "/artefact".into(),
    }];

    let container_id = ctx
        .driver
        .create_container(
            &image,
            &command,
            &mounts,
            &limits,
            Some(groups.1.path()),
            Some(&groups.1),
            &container_name,
        )
        .map_err(|e| DaemonError::TaskRun(e.to_string()))?;

    let run_result = run_and_watch(
        ctx,
        task_id,
        &container_id,
        &groups.1,
        env.wall_clock_time_limit,
        env.cpu_time_limit,
    );

    // Container removal is best-effort and always attempted, even if
    // run_and_watch itself failed.
    if let Err(e) = ctx.driver.remove_container(&container_id) {
        warn!(task_id, container = %container_id, error = %e, "failed to remove container");
    }

    let mut run_result = run_result.map_err(DaemonError::TaskRun)?;

    let artefact = extract_artefact(artefact_dir.path(), &mut run_result.stats);

    ctx.db.with_conn(|conn| {
        queries::finish(
            conn,
            task_id,
            run_result.exit_code,
            &run_result.output,
            Some(&run_result.stats),
            artefact.as_ref(),
        )
    })?;

    Ok(())
}

/// Poll `envManager.getImage(env)` with 20-second timeouts; on
/// each timeout, poke the task (refreshing its keep-alive window) and
/// continue waiting.
fn obtain_environment(ctx: &Context, task_id: i64, env: &RuntimeEnv) -> Result<String> {
    let (tx, rx) = std::sync::mpsc::channel();
    let env_manager = ctx.env_manager.clone();
    let env = env.clone();
    std::thread::spawn(move || {
        let result = env_manager.get_image(&env);
        let _ = tx.send(result);
    });

    loop {
        match rx.recv_timeout(Duration::from_secs(OBTAIN_ENV_POLL_SECS)) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => {
                ctx.db.with_conn(|conn| queries::poke(conn, task_id, None))?;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DaemonError::Internal(anyhow::anyhow!(
                    "environment build thread vanished without a result"
                )))
            }
        }
    }
}

fn unique_container_name(driver: &Driver, task_id: i64) -> Result<String> {
    let base = format!("surveyor-task-{task_id}");
    if !driver.container_exists(&base)? {
        return Ok(base);
    }
    for n in 1.. {
        let candidate = format!("{base}-{n}");
        if !driver.container_exists(&candidate)? {
            return Ok(candidate);
        }
    }
    unreachable!()
}

struct RunResult {
    exit_code: i64,
    output: String,
    stats: TaskStats,
}

/// Start the container, poll its status every second, notify every
/// `notify_interval` ticks, and enforce wall/CPU time limits by stopping the
/// container with a 1-second grace once either is exceeded.
fn run_and_watch(
    ctx: &Context,
    task_id: i64,
    container_id: &str,
    cgroup: &CgroupHandle,
    wall_clock_time_limit_secs: i64,
    cpu_time_limit_secs: i64,
) -> std::result::Result<RunResult, String> {
    ctx.driver
        .start_container(container_id, Some(cgroup))
        .map_err(|e| e.to_string())?;
    info!(task_id, container_id, "container started");

    let wall_limit_usec = wall_clock_time_limit_secs * 1_000_000;
    let cpu_limit_usec = cpu_time_limit_secs * 1_000_000;

    let mut timeout = false;
    let mut ticks: u64 = 0;
    let mut max_memory: i64 = 0;

    loop {
        std::thread::sleep(Duration::from_secs(RUN_POLL_SECS));
        ticks += 1;

        if ticks % ctx.notify_interval as u64 == 0 {
            if let Ok(logs) = ctx.driver.container_logs(container_id) {
                let _ = ctx.db.with_conn(|conn| queries::poke(conn, task_id, Some(&logs)));
            }
        }

        let inspection = ctx.driver.inspect_container(container_id).map_err(|e| e.to_string())?;
        if !inspection.is_running() {
            break;
        }

        let wall_time = inspection.run_time_micros();
        let cpu_time = cgroup
            .cpu_stats()
            .map_err(|e| e.to_string())?
            .get("usage_usec")
            .copied()
            .unwrap_or(0);
        let current_memory = cgroup.current_memory_usage().unwrap_or(0);
        max_memory = max_memory.max(current_memory);

        if wall_time >= wall_limit_usec || cpu_time >= cpu_limit_usec {
            let _ = ctx.driver.stop_container(container_id, Some(STOP_GRACE_SECS));
            timeout = true;
        }
    }

    let inspection = ctx.driver.inspect_container(container_id).map_err(|e| e.to_string())?;
    let cpu_stat = cgroup.cpu_stats().unwrap_or_default();
    let mem_stat = cgroup.memory_stats().unwrap_or_default();
    let output = ctx.driver.container_logs(container_id).map_err(|e| e.to_string())?;

    let stats = TaskStats {
        cpu_time: cpu_stat.get("usage_usec").copied().unwrap_or(0),
        user_time: cpu_stat.get("user_usec").copied().unwrap_or(0),
        system_time: cpu_stat.get("system_usec").copied().unwrap_or(0),
        wall_time: inspection.run_time_micros(),
        out_of_memory: inspection.state.oom_killed,
        timeout,
        mem_stat,
        mem_usage: max_memory,
        artefact_error: None,
    };

    Ok(RunResult {
        exit_code: inspection.state.exit_code,
        output,
        stats,
    })
}

/// Parse `<dir>/results.json`. Missing file, parse error, or
/// read error is recorded in `stats.artefactError`; the task still finishes
/// successfully with `result = None`.
fn extract_artefact(dir: &std::path::Path, stats: &mut TaskStats) -> Option<serde_json::Value> {
    let path = dir.join("results.json");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            stats.artefact_error = Some("No artefact file found".to_string());
            return None;
        }
        Err(e) => {
            stats.artefact_error = Some(format!("Invalid artefact file: {e}"));
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            stats.artefact_error = Some(format!("Invalid artefact file: {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_artefact_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = TaskStats::default();
        let result = extract_artefact(dir.path(), &mut stats);
        assert!(result.is_none());
        assert_eq!(stats.artefact_error.as_deref(), Some("No artefact file found"));
    }

    #[test]
    fn test_extract_artefact_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("results.json"), "{not json").unwrap();
        let mut stats = TaskStats::default();
        let result = extract_artefact(dir.path(), &mut stats);
        assert!(result.is_none());
        assert!(stats.artefact_error.is_some());
    }

    #[test]
    fn test_extract_artefact_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("results.json"), r#"{"k":1}"#).unwrap();
        let mut stats = TaskStats::default();
        let result = extract_artefact(dir.path(), &mut stats);
        assert_eq!(result, Some(serde_json::json!({"k": 1})));
        assert!(stats.artefact_error.is_none());
    }
}
