//! Container Driver: a stateless façade over an external container engine,
//! invoked as subprocesses (conventionally `podman`, configurable).
//!
//! Calls are synchronous except `build_image` with a log callback, which
//! streams lines until the child exits. This module never talks to the
//! engine over its HTTP API — the cgroup-parent workaround below needs
//! process-level control an HTTP client cannot give.

pub mod inspect;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::cgroup::Handle;
use crate::error::{DaemonError, Result};
pub use inspect::Inspection;

#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub cpu_limit: Option<i64>,
    pub memory_limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Driver {
    binary: String,
    cgroup_manager: String,
    cgroup_parent_workaround: bool,
}

impl Driver {
    pub fn new(binary: impl Into<String>, cgroup_manager: impl Into<String>, cgroup_parent_workaround: bool) -> Self {
        Self {
            binary: binary.into(),
            cgroup_manager: cgroup_manager.into(),
            cgroup_parent_workaround,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--cgroup-manager").arg(&self.cgroup_manager);
        cmd.args(args);
        cmd
    }

    fn invoke(&self, args: &[String]) -> Result<String> {
        debug!(engine = %self.binary, ?args, "invoking engine command");
        let output = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| DaemonError::Engine(format!("failed to spawn {}: {e}", self.binary)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(DaemonError::Engine(combined));
        }
        Ok(combined)
    }

    /// Run `args` from a forked child that first joins `cgroup` before
    /// exec'ing the engine binary, when the cgroup-parent workaround is
    /// enabled. Some engine versions refuse `--cgroup-parent` directly for a
    /// delegated scope; this places the spawned process into the cgroup at
    /// the OS level instead.
    fn invoke_in_cgroup(&self, args: &[String], cgroup: Option<&Handle>) -> Result<String> {
        let Some(cgroup) = cgroup.filter(|_| self.cgroup_parent_workaround) else {
            return self.invoke(args);
        };

        let cgroup_procs = cgroup.fs_path().join("cgroup.procs");
        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        // SAFETY: the closure only performs a single write(2) to join the
        // cgroup before exec, mirroring the original's fork-then-addProcess
        // sequence; no allocation beyond what `std::fs::write` itself does.
        unsafe {
            cmd.pre_exec(move || {
                std::fs::write(&cgroup_procs, format!("{}\n", std::process::id()))?;
                Ok(())
            });
        }

        let output = cmd
            .output()
            .map_err(|e| DaemonError::Engine(format!("failed to spawn {}: {e}", self.binary)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(DaemonError::Engine(combined));
        }
        Ok(combined)
    }

    pub fn image_exists(&self, name: &str) -> Result<bool> {
        let status = self
            .command(&["image".into(), "exists".into(), name.into()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| DaemonError::Engine(format!("failed to spawn {}: {e}", self.binary)))?;
        Ok(status.success())
    }

    pub fn container_exists(&self, name: &str) -> Result<bool> {
        let status = self
            .command(&["container".into(), "exists".into(), name.into()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| DaemonError::Engine(format!("failed to spawn {}: {e}", self.binary)))?;
        Ok(status.success())
    }

    /// Build an image from `dockerfile` text. No-cache is the caller's
    /// responsibility to request via `no_cache` — the Environment Manager
    /// always sets it, since cached layers may have pulled external
    /// dependencies the user explicitly wants re-fetched.
    pub fn build_image(
        &self,
        dockerfile: &str,
        tag: &str,
        build_args: &HashMap<String, String>,
        limits: &ResourceLimits,
        no_cache: bool,
        mut on_log_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<String> {
        let dir = tempfile::tempdir().map_err(DaemonError::Io)?;
        let dockerfile_path = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile).map_err(DaemonError::Io)?;

        let mut args: Vec<String> = vec!["build".into(), "-t".into(), tag.into()];
        for (k, v) in build_args {
            args.push("--build-arg".into());
            args.push(format!("{k}={v}"));
        }
        if no_cache {
            args.push("--no-cache".into());
        }
        if let Some(mem) = limits.memory_limit {
            args.push("--memory".into());
            args.push(mem.to_string());
        }
        if let Some(cpu) = limits.cpu_limit {
            args.push("--cpu-period".into());
            args.push("100000".into());
            args.push("--cpu-quota".into());
            args.push((100_000 * cpu).to_string());
        }
        args.push("-f".into());
        args.push(dockerfile_path.display().to_string());
        args.push(dir.path().display().to_string());

        match on_log_line.as_deref_mut() {
            None => self.invoke(&args),
            Some(callback) => self.stream_build(&args, callback),
        }
    }

    fn stream_build(&self, args: &[String], on_log_line: &mut dyn FnMut(&str)) -> Result<String> {
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DaemonError::Engine(format!("failed to spawn {}: {e}", self.binary)))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut combined = String::new();
        for line in BufReader::new(stdout).lines() {
            let line = line.map_err(DaemonError::Io)?;
            on_log_line(&line);
            combined.push_str(&line);
            combined.push('\n');
        }

        let status = child.wait().map_err(DaemonError::Io)?;
        if let Some(mut stderr) = child.stderr.take() {
            let mut err = String::new();
            let _ = std::io::Read::read_to_string(&mut stderr, &mut err);
            combined.push_str(&err);
        }

        if !status.success() {
            return Err(DaemonError::Engine(combined));
        }
        Ok(combined)
    }

    /// Create a container, returning its id. When `cgroup` is set and the
    /// workaround is enabled, the engine CLI process is forked into that
    /// cgroup before exec rather than relying on `--cgroup-parent`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_container(
        &self,
        image: &str,
        command: &[String],
        mounts: &[BindMount],
        limits: &ResourceLimits,
        cgroup_parent: Option<&str>,
        cgroup: Option<&Handle>,
        name: &str,
    ) -> Result<String> {
        let mut args: Vec<String> = vec![
            "container".into(),
            "create".into(),
            "--runtime".into(),
            "crun".into(),
        ];
        for mount in mounts {
            args.push("--mount".into());
            args.push(format!(
                "type=bind,src={},target={}",
                mount.source, mount.target
            ));
        }
        if let Some(cpu) = limits.cpu_limit {
            args.push("--cpus".into());
            args.push(cpu.to_string());
        }
        if let Some(mem) = limits.memory_limit {
            args.push("--memory".into());
            args.push(mem.to_string());
            args.push("--memory-swap".into());
            args.push(mem.to_string());
        }
        if let Some(parent) = cgroup_parent {
            args.push("--cgroup-parent".into());
            args.push(parent.into());
        }
        args.push("--name".into());
        args.push(name.into());
        args.push(image.into());
        args.extend(command.iter().cloned());

        let output = self.invoke_in_cgroup(&args, cgroup)?;
        Ok(output.trim().to_string())
    }

    /// Start an existing container, via the fork-into-cgroup workaround when
    /// enabled.
    pub fn start_container(&self, id: &str, cgroup: Option<&Handle>) -> Result<()> {
        let args = vec![
            "container".into(),
            "start".into(),
            "--runtime".into(),
            "crun".into(),
            id.to_string(),
        ];
        self.invoke_in_cgroup(&args, cgroup)?;
        Ok(())
    }

    pub fn inspect_container(&self, id: &str) -> Result<Inspection> {
        let output = self.invoke(&["inspect".into(), id.into()])?;
        let mut parsed: Vec<Inspection> =
            serde_json::from_str(&output).map_err(|e| DaemonError::Engine(e.to_string()))?;
        parsed
            .pop()
            .ok_or_else(|| DaemonError::Engine(format!("empty inspect result for {id}")))
    }

    pub fn stop_container(&self, id: &str, timeout: Option<u32>) -> Result<()> {
        let mut args = vec!["stop".to_string(), id.to_string()];
        if let Some(timeout) = timeout {
            args.push("--timeout".into());
            args.push(timeout.to_string());
        }
        self.invoke(&args)?;
        Ok(())
    }

    pub fn remove_container(&self, id: &str) -> Result<()> {
        self.invoke(&["container".into(), "rm".into(), "-f".into(), id.into()])?;
        Ok(())
    }

    pub fn container_logs(&self, id: &str) -> Result<String> {
        self.invoke(&["logs".into(), id.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_assembled_with_no_cache_and_limits() {
        // Smoke-tests argument assembly without invoking a real engine by
        // exercising the private arg-building logic indirectly through a
        // driver pointed at `/bin/true`-like "echo" so build never actually
        // runs podman in unit tests.
        let driver = Driver::new("true", "cgroupfs", false);
        let limits = ResourceLimits {
            cpu_limit: Some(2),
            memory_limit: Some(256 * 1024 * 1024),
        };
        // `true` ignores all arguments and exits 0 regardless of them; this
        // exercises the full build_image path (tempdir + Dockerfile write +
        // invoke) without depending on a container engine being installed.
        let result = driver.build_image(
            "FROM alpine\n",
            "tag:test",
            &HashMap::new(),
            &limits,
            true,
            None,
        );
        assert!(result.is_ok());
    }
}
