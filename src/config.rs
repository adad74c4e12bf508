use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Sample;

/// External command line: program followed by fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_zephyr_path() -> PathBuf {
    PathBuf::from("zephyrproject/zephyr")
}

fn default_dashboard_url() -> String {
    "https://zephyr-dashboard.renode.io".to_string()
}

fn default_build_script() -> CommandSpec {
    CommandSpec::new("./build_and_copy_bin.sh", &[])
}

fn default_simulator() -> CommandSpec {
    CommandSpec::new(
        "./renode_portable/renode-test",
        &["--kill-stale-renode-instances"],
    )
}

fn default_simulator_version() -> CommandSpec {
    CommandSpec::new("renode", &["-v"])
}

fn default_translator() -> CommandSpec {
    CommandSpec::new("python3", &[])
}

fn default_sim_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_sim_timeout_secs() -> u64 {
    30
}

fn default_log_grace_ms() -> u64 {
    1000
}

fn default_monitor_line_limit() -> usize {
    100
}

fn default_flash_alias() -> String {
    "zephyr,flash".to_string()
}

fn default_configs_dir() -> PathBuf {
    PathBuf::from("configs")
}

fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_jobs() -> usize {
    1
}

fn default_sample() -> Sample {
    Sample::HelloWorld
}

/// Immutable run configuration, built once at startup and shared by every
/// worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_sample")]
    pub sample: Sample,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_zephyr_path")]
    pub zephyr_path: PathBuf,
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
    #[serde(default = "default_build_script")]
    pub build_script: CommandSpec,
    #[serde(default = "default_simulator")]
    pub simulator: CommandSpec,
    #[serde(default = "default_simulator_version")]
    pub simulator_version: CommandSpec,
    #[serde(default = "default_translator")]
    pub translator: CommandSpec,
    /// Root of the per-target directories the simulator runs in and writes
    /// `monitor.txt` and `log.html` into.
    #[serde(default = "default_sim_work_dir")]
    pub sim_work_dir: PathBuf,
    #[serde(default = "default_sim_timeout_secs")]
    pub sim_timeout_secs: u64,
    #[serde(default = "default_log_grace_ms")]
    pub log_grace_ms: u64,
    #[serde(default = "default_monitor_line_limit")]
    pub monitor_line_limit: usize,
    #[serde(default = "default_flash_alias")]
    pub flash_alias: String,
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub force_sim: bool,
    #[serde(default)]
    pub force_build: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample: default_sample(),
            artifacts_dir: default_artifacts_dir(),
            zephyr_path: default_zephyr_path(),
            dashboard_url: default_dashboard_url(),
            build_script: default_build_script(),
            simulator: default_simulator(),
            simulator_version: default_simulator_version(),
            translator: default_translator(),
            sim_work_dir: default_sim_work_dir(),
            sim_timeout_secs: default_sim_timeout_secs(),
            log_grace_ms: default_log_grace_ms(),
            monitor_line_limit: default_monitor_line_limit(),
            flash_alias: default_flash_alias(),
            configs_dir: default_configs_dir(),
            snapshots_dir: default_snapshots_dir(),
            jobs: default_jobs(),
            force_sim: false,
            force_build: false,
        }
    }
}

impl RunConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Apply `SAMPLE_NAME` (or the 1-based `CI_NODE_INDEX` into the sample
    /// list when no name is given), `SIM_JOBS`, `FORCE_SIM` and `FORCE_BUILD`.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(sample) = lookup("SAMPLE_NAME") {
            self.sample = sample.parse()?;
        } else if let Some(node) = lookup("CI_NODE_INDEX") {
            let index: usize = node
                .parse()
                .with_context(|| format!("CI_NODE_INDEX is not a number: {}", node))?;
            self.sample = index
                .checked_sub(1)
                .and_then(|i| Sample::ALL.get(i).copied())
                .ok_or_else(|| anyhow!("CI_NODE_INDEX {} has no matching sample", index))?;
        }
        if let Some(jobs) = lookup("SIM_JOBS") {
            self.jobs = jobs
                .parse()
                .with_context(|| format!("SIM_JOBS is not a number: {}", jobs))?;
        }
        // Presence is enough, matching how CI sets these flags.
        if lookup("FORCE_SIM").is_some_and(|v| !v.is_empty()) {
            self.force_sim = true;
        }
        if lookup("FORCE_BUILD").is_some_and(|v| !v.is_empty()) {
            self.force_build = true;
        }
        Ok(())
    }

    pub fn sim_timeout(&self) -> Duration {
        Duration::from_secs(self.sim_timeout_secs)
    }

    pub fn log_grace(&self) -> Duration {
        Duration::from_millis(self.log_grace_ms)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.artifacts_dir.join("results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_overrides_keep_defaults() {
        let cfg: RunConfig = serde_yaml::from_str(
            "sample: shell_module\nsim_timeout_secs: 5\nsimulator:\n  program: sh\n  args: [\"-c\"]\n",
        )
        .unwrap();
        assert_eq!(cfg.sample, Sample::ShellModule);
        assert_eq!(cfg.sim_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.simulator.program, "sh");
        assert_eq!(cfg.monitor_line_limit, 100);
        assert_eq!(cfg.flash_alias, "zephyr,flash");
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SAMPLE_NAME", "micropython"),
            ("SIM_JOBS", "4"),
            ("FORCE_SIM", "1"),
        ]);
        let mut cfg = RunConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.sample, Sample::Micropython);
        assert_eq!(cfg.jobs, 4);
        assert!(cfg.force_sim);
        assert!(!cfg.force_build);
    }

    #[test]
    fn ci_node_index_selects_sample_when_unnamed() {
        let mut cfg = RunConfig::default();
        cfg.apply_env_from(|k| (k == "CI_NODE_INDEX").then(|| "3".to_string()))
            .unwrap();
        assert_eq!(cfg.sample, Sample::Philosophers);

        let env: HashMap<&str, &str> =
            HashMap::from([("SAMPLE_NAME", "shell_module"), ("CI_NODE_INDEX", "5")]);
        let mut cfg = RunConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.sample, Sample::ShellModule);

        for bad in ["0", "6", "first"] {
            let mut cfg = RunConfig::default();
            assert!(cfg
                .apply_env_from(|k| (k == "CI_NODE_INDEX").then(|| bad.to_string()))
                .is_err());
        }
    }

    #[test]
    fn env_rejects_unknown_sample() {
        let mut cfg = RunConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "SAMPLE_NAME").then(|| "blinky".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("blinky"));
    }
}
