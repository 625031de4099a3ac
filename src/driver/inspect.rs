//! Parsed shape of `<engine> inspect` output, and the runtime derivations
//! the Task Supervisor and run-and-watch loop read from it.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Inspection {
    #[serde(rename = "State")]
    pub state: State,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct State {
    #[serde(rename = "StartedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "FinishedAt")]
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ExitCode")]
    pub exit_code: i64,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "CgroupParent")]
    pub cgroup_parent: String,
}

impl Inspection {
    pub fn is_running(&self) -> bool {
        self.state.status == "running"
    }

    /// `FinishedAt - StartedAt` in microseconds. If `FinishedAt` is the
    /// Unix-epoch sentinel (container still running), substitute "now".
    pub fn run_time_micros(&self) -> i64 {
        let finished = if self.state.finished_at.timestamp() <= 0 {
            Utc::now()
        } else {
            self.state.finished_at
        };
        let delta = finished - self.state.started_at;
        delta.num_microseconds().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(finished_at: &str) -> Inspection {
        let raw = format!(
            r#"{{"State":{{"StartedAt":"2024-01-01T00:00:00Z","FinishedAt":"{}","Status":"exited","ExitCode":0,"OOMKilled":false}},"HostConfig":{{"CgroupParent":"/manager/task1/benchmark"}}}}"#,
            finished_at
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn test_run_time_uses_finished_at() {
        let inspection = sample("2024-01-01T00:00:05Z");
        assert_eq!(inspection.run_time_micros(), 5_000_000);
        assert!(!inspection.is_running());
    }

    #[test]
    fn test_run_time_substitutes_now_for_epoch_sentinel() {
        let inspection = sample("1970-01-01T00:00:00Z");
        assert!(inspection.run_time_micros() > 0);
    }
}
