//! Runner Loop: single-threaded scheduler. Polls for runnable work,
//! admits it through the Resource Manager, and spawns one worker thread per
//! accepted task; the supervisors run as worker threads, not async tasks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cgroup::Handle as CgroupHandle;
use crate::config::Configuration;
use crate::db::{queries, Database};
use crate::driver::Driver;
use crate::environment;
use crate::error::Result;
use crate::resource;
use crate::supervisor;

const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct RunnerOptions {
    pub cpu_limit: i64,
    pub mem_limit: i64,
    pub job_limit: i64,
    pub runner_id: String,
    pub use_scope: bool,
}

/// Bring up the runner's own cgroup, shared state, and enter the scheduling
/// loop. Returns only on an unrecoverable setup error; once the loop starts
/// it runs forever.
pub fn run(config: &Configuration, opts: RunnerOptions) -> Result<()> {
    let cgroup = if opts.use_scope {
        CgroupHandle::create_scope(config.cgroup.root.clone(), &format!("surveyor-runner-{}", opts.runner_id))
            .map_err(|e| crate::error::DaemonError::Cgroup(e.to_string()))?
    } else {
        CgroupHandle::process_group(config.cgroup.root.clone())
            .map_err(|e| crate::error::DaemonError::Cgroup(e.to_string()))?
    };
    cgroup
        .enable_controllers(&["cpu", "memory"])
        .map_err(|e| crate::error::DaemonError::Cgroup(e.to_string()))?;
    let cgroup = Arc::new(cgroup);

    let db_path = config.system.data_directory.join("benchyard.db");
    let db = Arc::new(Database::open(&db_path)?);
    let driver = Arc::new(Driver::new(
        config.engine.binary.clone(),
        config.engine.cgroup_manager.clone(),
        config.engine.cgroup_parent_workaround,
    ));
    let env_manager = Arc::new(environment::Manager::new(driver.clone(), config.cgroup.build_pool_width));
    let resources = Arc::new(resource::Manager::new(opts.job_limit, opts.cpu_limit, opts.mem_limit));
    let ctx = Arc::new(supervisor::Context {
        db: db.clone(),
        driver,
        env_manager,
        notify_interval: config.cgroup.notify_interval,
    });

    info!(
        runner_id = %opts.runner_id,
        cpu_limit = opts.cpu_limit,
        mem_limit = opts.mem_limit,
        job_limit = opts.job_limit,
        "runner loop starting"
    );

    loop {
        if resources.available("job") <= 0 {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let task_id = db.with_conn(|conn| {
            queries::fetch_runnable(
                conn,
                resources.available("cpu"),
                resources.available("mem"),
                config.cgroup.reclaim_minutes,
            )
        })?;

        let Some(task_id) = task_id else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };

        let task = match db.with_conn(|conn| queries::get_task(conn, task_id))? {
            Some(task) => task,
            None => continue,
        };
        let env = match db.with_conn(|conn| queries::get_env_by_suite(conn, task.suite_id))? {
            Some(env) => env,
            None => continue,
        };

        let loan = match resources.capture(&[
            ("job", 1),
            ("cpu", env.cpu_limit),
            ("mem", env.memory_limit),
        ]) {
            Ok(loan) => loan,
            Err(_) => {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
        };

        let acquired = db.with_conn(|conn| queries::acquire(conn, task_id, &opts.runner_id))?;
        if !acquired {
            // Another runner (or our own reclamation window) beat us to it.
            drop(loan);
            continue;
        }

        let worker_ctx = ctx.clone();
        let worker_cgroup = cgroup.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("task-{task_id}"))
            .spawn(move || {
                let _loan = loan;
                if let Err(e) = supervisor::evaluate_task(&worker_ctx, task_id, &worker_cgroup) {
                    error!(task_id, error = %e, "task evaluation returned an error");
                }
            });

        if let Err(e) = spawned {
            warn!(task_id, error = %e, "failed to spawn supervisor thread, abandoning task");
            db.with_conn(|conn| queries::abandon(conn, task_id))?;
        }
    }
}
