//! Configuration structures and loading

use std::path::PathBuf;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Reporting API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Container engine configuration
    #[serde(default)]
    pub engine: EngineConfiguration,

    /// Cgroup configuration
    #[serde(default)]
    pub cgroup: CgroupConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            api: ApiConfiguration::default(),
            system: SystemConfiguration::default(),
            engine: EngineConfiguration::default(),
            cgroup: CgroupConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration = toml::from_str(&content)
            .with_context(|| "Failed to parse configuration")?;

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.data_directory)?;
        std::fs::create_dir_all(&config.system.tmp_directory)?;
        std::fs::create_dir_all(&config.system.log_directory)?;

        Ok(config)
    }

    /// Load configuration from a TOML file if it exists, else fall back to
    /// defaults with no path resolution against a config directory.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            std::fs::create_dir_all(&config.system.data_directory)?;
            std::fs::create_dir_all(&config.system.tmp_directory)?;
            std::fs::create_dir_all(&config.system.log_directory)?;
            Ok(config)
        }
    }
}

/// Reporting API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Directory holding the sqlite database
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Scratch directory for per-task artifact staging
    #[serde(default = "default_tmp_directory")]
    pub tmp_directory: PathBuf,

    /// Log directory
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            tmp_directory: default_tmp_directory(),
            log_directory: default_log_directory(),
        }
    }
}

impl SystemConfiguration {
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.data_directory = Self::resolve_path(&self.data_directory, base_dir);
        self.tmp_directory = Self::resolve_path(&self.tmp_directory, base_dir);
        self.log_directory = Self::resolve_path(&self.log_directory, base_dir);
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from(".benchyard/data")
}

fn default_tmp_directory() -> PathBuf {
    PathBuf::from(".benchyard/tmp")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".benchyard/logs")
}

/// Container engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfiguration {
    /// Engine binary to invoke (e.g. "podman", "docker")
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// Cgroup manager flag passed to the engine
    #[serde(default = "default_cgroup_manager")]
    pub cgroup_manager: String,

    /// Whether the fork-before-exec cgroup-parent workaround is enabled.
    /// Some engine versions refuse `--cgroup-parent` for a delegated scope
    /// directly; when enabled, container create/start place the spawned
    /// process into the cgroup before exec'ing the engine binary.
    #[serde(default = "default_cgroup_workaround")]
    pub cgroup_parent_workaround: bool,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            cgroup_manager: default_cgroup_manager(),
            cgroup_parent_workaround: default_cgroup_workaround(),
        }
    }
}

fn default_engine_binary() -> String {
    "podman".into()
}

fn default_cgroup_manager() -> String {
    "cgroupfs".into()
}

fn default_cgroup_workaround() -> bool {
    true
}

/// Cgroup configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CgroupConfiguration {
    /// Mount point of the unified cgroup v2 hierarchy.
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,

    /// Number of builds that may run concurrently in the Environment Manager.
    #[serde(default = "default_build_pool_width")]
    pub build_pool_width: usize,

    /// How many 1-second poll ticks between `notify()` calls in the
    /// run-and-watch loop.
    #[serde(default = "default_notify_interval")]
    pub notify_interval: u32,

    /// Minutes of silence before an `assigned` task is reclaimable.
    #[serde(default = "default_reclaim_minutes")]
    pub reclaim_minutes: i64,
}

impl Default for CgroupConfiguration {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            build_pool_width: default_build_pool_width(),
            notify_interval: default_notify_interval(),
            reclaim_minutes: default_reclaim_minutes(),
        }
    }
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_build_pool_width() -> usize {
    3
}

fn default_notify_interval() -> u32 {
    10
}

fn default_reclaim_minutes() -> i64 {
    5
}
