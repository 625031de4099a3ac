//! `run` subcommand: the scheduling runner CLI.

use clap::Args;
use sysinfo::System;
use tracing::info;

use crate::config::Configuration;
use crate::error::Result;
use crate::runner::{self, RunnerOptions};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of CPU cores this runner may admit work for. Defaults to
    /// (logical cores - 1), leaving one for the host.
    #[arg(short = 'c', long = "cpulimit")]
    pub cpu_limit: Option<i64>,

    /// Bytes of memory this runner may admit work for. Defaults to total
    /// physical memory.
    #[arg(short = 'm', long = "memlimit")]
    pub mem_limit: Option<i64>,

    /// Maximum number of tasks this runner executes concurrently. Defaults
    /// to (logical cores - 1).
    #[arg(short = 'j', long = "joblimit")]
    pub job_limit: Option<i64>,

    /// Identifier recorded as this runner's `assignee`. Defaults to the
    /// host's hostname.
    #[arg(short = 'i', long = "id")]
    pub runner_id: Option<String>,

    /// Request a delegated systemd scope for this runner's own cgroup.
    #[arg(long, conflicts_with = "no_scope")]
    pub scope: bool,

    /// Skip the systemd scope and operate out of this process's current
    /// cgroup instead (useful when already run under a managed unit).
    #[arg(long, conflicts_with = "scope")]
    pub no_scope: bool,
}

struct ResolvedDefaults {
    cpu_limit: i64,
    mem_limit: i64,
    job_limit: i64,
    runner_id: String,
    use_scope: bool,
}

/// Fill in any flag the caller left unset from live host info. Kept separate
/// from `execute` so the fallback arithmetic is testable without a real
/// `Configuration`/runner loop.
fn resolve_defaults(args: &RunArgs, sys: &System, hostname: Option<String>) -> ResolvedDefaults {
    let logical_cores = sys.cpus().len() as i64;
    ResolvedDefaults {
        cpu_limit: args.cpu_limit.unwrap_or_else(|| (logical_cores - 1).max(1)),
        job_limit: args.job_limit.unwrap_or_else(|| (logical_cores - 1).max(1)),
        mem_limit: args.mem_limit.unwrap_or_else(|| sys.total_memory() as i64),
        runner_id: args
            .runner_id
            .clone()
            .or(hostname)
            .unwrap_or_else(|| "runner".to_string()),
        use_scope: !args.no_scope,
    }
}

pub fn execute(args: RunArgs, config: &Configuration) -> Result<()> {
    let mut sys = System::new_all();
    sys.refresh_all();

    let resolved = resolve_defaults(&args, &sys, System::host_name());

    info!(
        cpu_limit = resolved.cpu_limit,
        mem_limit = resolved.mem_limit,
        job_limit = resolved.job_limit,
        runner_id = %resolved.runner_id,
        "resolved runner defaults"
    );

    runner::run(
        config,
        RunnerOptions {
            cpu_limit: resolved.cpu_limit,
            mem_limit: resolved.mem_limit,
            job_limit: resolved.job_limit,
            runner_id: resolved.runner_id,
            use_scope: resolved.use_scope,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(overrides: RunArgs) -> RunArgs {
        overrides
    }

    fn bare_args() -> RunArgs {
        RunArgs {
            cpu_limit: None,
            mem_limit: None,
            job_limit: None,
            runner_id: None,
            scope: false,
            no_scope: false,
        }
    }

    #[test]
    fn test_explicit_flags_are_never_overridden() {
        let mut sys = System::new_all();
        sys.refresh_all();

        let resolved = resolve_defaults(
            &args(RunArgs {
                cpu_limit: Some(2),
                mem_limit: Some(1024),
                job_limit: Some(3),
                runner_id: Some("fixed-id".to_string()),
                scope: false,
                no_scope: false,
            }),
            &sys,
            Some("some-host".to_string()),
        );

        assert_eq!(resolved.cpu_limit, 2);
        assert_eq!(resolved.mem_limit, 1024);
        assert_eq!(resolved.job_limit, 3);
        assert_eq!(resolved.runner_id, "fixed-id");
    }

    #[test]
    fn test_defaults_fall_back_to_hostname_then_runner() {
        let sys = System::new_all();

        let resolved = resolve_defaults(&bare_args(), &sys, Some("my-host".to_string()));
        assert_eq!(resolved.runner_id, "my-host");

        let resolved = resolve_defaults(&bare_args(), &sys, None);
        assert_eq!(resolved.runner_id, "runner");
    }

    #[test]
    fn test_cpu_and_job_limit_defaults_never_go_below_one() {
        // A single-core sandbox would otherwise compute cores - 1 == 0.
        let sys = System::new_all();
        let resolved = resolve_defaults(&bare_args(), &sys, None);
        assert!(resolved.cpu_limit >= 1);
        assert!(resolved.job_limit >= 1);
    }

    #[test]
    fn test_use_scope_is_negation_of_no_scope() {
        let sys = System::new_all();

        let mut a = bare_args();
        a.no_scope = true;
        assert!(!resolve_defaults(&a, &sys, None).use_scope);

        let b = bare_args();
        assert!(resolve_defaults(&b, &sys, None).use_scope);
    }
}
