//! Cgroup Handle: a thin representation of a node in the host's unified
//! cgroup v2 hierarchy (conventionally rooted at `/sys/fs/cgroup`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroup filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create delegated scope: {0}")]
    ScopeCreate(String),
}

type Result<T> = std::result::Result<T, CgroupError>;

/// A handle onto `<cgroup_root>/<path>`. Holds one path string, relative to
/// the unified hierarchy's mount point.
pub struct Handle {
    root: PathBuf,
    path: String,
    dummy: Option<Child>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.path)
    }
}

impl Handle {
    pub fn new(root: PathBuf, path: impl Into<String>) -> Self {
        Self {
            root,
            path: path.into(),
            dummy: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Filesystem location of this cgroup's directory.
    pub fn fs_path(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }

    fn io_err(&self, file: &str, source: std::io::Error) -> CgroupError {
        CgroupError::Io {
            path: self.fs_path().join(file),
            source,
        }
    }

    /// Read the calling process's own cgroup path from `/proc/self/cgroup`
    /// (unified hierarchy: a single `0::<path>` line).
    pub fn process_group(root: PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string("/proc/self/cgroup").map_err(|e| CgroupError::Io {
            path: PathBuf::from("/proc/self/cgroup"),
            source: e,
        })?;
        let path = content
            .split("::")
            .nth(1)
            .unwrap_or(&content)
            .trim()
            .to_string();
        Ok(Self::new(root, path))
    }

    /// Ask the host service manager (systemd, via `busctl`) to create a
    /// delegated transient scope unit containing the current process with
    /// CPU and memory accounting enabled, then move the current process into
    /// a child subgroup named `manager` (a parent scope cannot have both
    /// processes and `subtree_control` edits).
    pub fn create_scope(root: PathBuf, name: &str) -> Result<Self> {
        let pid = std::process::id().to_string();
        let output = Command::new("busctl")
            .args([
                "call",
                "--user",
                "org.freedesktop.systemd1",
                "/org/freedesktop/systemd1",
                "org.freedesktop.systemd1.Manager",
                "StartTransientUnit",
                "ssa(sv)a(sa(sv))",
                &format!("{name}.scope"),
                "fail",
                "4",
                "PIDs",
                "au",
                "1",
                &pid,
                "Delegate",
                "b",
                "1",
                "MemoryAccounting",
                "b",
                "1",
                "CPUAccounting",
                "b",
                "1",
                "0",
            ])
            .output()
            .map_err(|e| CgroupError::Io {
                path: PathBuf::from("busctl"),
                source: e,
            })?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(CgroupError::ScopeCreate(text));
        }

        let scope = Self::process_group(root.clone())?;

        let manager_path = scope.fs_path().join("manager");
        std::fs::create_dir(&manager_path).map_err(|e| scope.io_err("manager", e))?;
        let manager = Self::new(root, format!("{}/manager", scope.path));
        manager.add_process(std::process::id())?;

        Ok(scope)
    }

    /// Create `<path>/<name>`, enable the requested controllers on it, and
    /// return a handle. Caller is responsible for calling `release` (or
    /// wrapping in a `scopeguard`) on every exit path.
    pub fn new_group(&self, name: &str, controllers: &[&str]) -> Result<Self> {
        let group_path = format!("{}/{}", self.path, name);
        let dir_path = self.fs_path().join(name);
        std::fs::create_dir(&dir_path).map_err(|e| self.io_err(name, e))?;
        let group = Self::new(self.root.clone(), group_path);
        if !controllers.is_empty() {
            group.enable_controllers(controllers)?;
        }
        Ok(group)
    }

    /// Write `+<ctrl>` tokens into `cgroup.subtree_control`.
    pub fn enable_controllers(&self, controllers: &[&str]) -> Result<()> {
        let tokens = controllers
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(self.fs_path().join("cgroup.subtree_control"), tokens)
            .map_err(|e| self.io_err("cgroup.subtree_control", e))
    }

    /// Write `pid` into `cgroup.procs`.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        std::fs::write(self.fs_path().join("cgroup.procs"), format!("{pid}\n"))
            .map_err(|e| self.io_err("cgroup.procs", e))
    }

    fn read_keyed_stats(&self, filename: &str) -> Result<HashMap<String, i64>> {
        let content = std::fs::read_to_string(self.fs_path().join(filename))
            .map_err(|e| self.io_err(filename, e))?;
        let mut map = HashMap::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                if let Ok(v) = value.parse::<i64>() {
                    map.insert(key.to_string(), v);
                }
            }
        }
        Ok(map)
    }

    pub fn cpu_stats(&self) -> Result<HashMap<String, i64>> {
        self.read_keyed_stats("cpu.stat")
    }

    pub fn memory_stats(&self) -> Result<HashMap<String, i64>> {
        self.read_keyed_stats("memory.stat")
    }

    /// Read `memory.current` as integer bytes.
    pub fn current_memory_usage(&self) -> Result<i64> {
        let content = std::fs::read_to_string(self.fs_path().join("memory.current"))
            .map_err(|e| self.io_err("memory.current", e))?;
        Ok(content.trim().parse().unwrap_or(0))
    }

    /// Pin a dummy long-sleep process in the group so the kernel does not
    /// garbage-collect an otherwise empty leaf.
    pub fn occupy(&mut self) -> Result<()> {
        let child = Command::new("sleep")
            .arg("infinity")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.io_err("sleep", e))?;
        self.add_process(child.id())?;
        self.dummy = Some(child);
        Ok(())
    }

    /// Release the group: kill the dummy process (if any) and `rmdir` the
    /// directory, ignoring "already gone". Idempotent.
    pub fn release(&mut self) {
        if let Some(mut child) = self.dummy.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        match std::fs::remove_dir(self.fs_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.fs_path().display(), error = %e, "failed to remove cgroup directory"),
        }
        debug!(path = %self.path, "released cgroup");
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(mut child) = self.dummy.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_keyed_stats() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 1234\nuser_usec 1000\n")
            .unwrap();
        let handle = Handle::new(dir.path().to_path_buf(), "".to_string());
        let stats = handle.cpu_stats().unwrap();
        assert_eq!(stats.get("usage_usec"), Some(&1234));
        assert_eq!(stats.get("user_usec"), Some(&1000));
    }

    #[test]
    fn test_new_group_and_release() {
        let dir = tempdir().unwrap();
        let root = Handle::new(dir.path().to_path_buf(), "".to_string());
        let mut group = root.new_group("child", &[]).unwrap();
        assert!(group.fs_path().exists());
        group.release();
        assert!(!group.fs_path().exists());
    }

    #[test]
    fn test_fs_path_join() {
        let handle = Handle::new(PathBuf::from("/sys/fs/cgroup"), "/manager/task1".to_string());
        assert_eq!(
            handle.fs_path(),
            PathBuf::from("/sys/fs/cgroup/manager/task1")
        );
    }
}
