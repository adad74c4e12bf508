use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

use crate::config::{CommandSpec, RunConfig};
use crate::error::RunError;
use crate::remote::{fetch_remote_version, ArtifactStore};

/// Simulator build parsed from its version banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorVersion {
    pub commit: String,
    /// `renode-<version>+<yyyymmdd>@git<commit>`
    pub full: String,
}

/// Parse a banner such as `Renode v1.15.3.29906 (b2e8ff63-202409241312)`.
pub fn parse_simulator_version(banner: &str) -> Option<SimulatorVersion> {
    let tokens: Vec<&str> = banner.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let build = tokens[tokens.len() - 1]
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let (commit, stamp) = build.split_once('-')?;
    let date: String = stamp.chars().take(8).collect();

    let numbers: Vec<&str> = tokens[tokens.len() - 2]
        .trim_start_matches('v')
        .split('.')
        .collect();
    let version = numbers[..numbers.len().saturating_sub(1)].join(".");
    if commit.is_empty() || version.is_empty() {
        return None;
    }

    Some(SimulatorVersion {
        commit: commit.to_string(),
        full: format!("renode-{}+{}@git{}", version, date, commit),
    })
}

/// Commit part of a published simulator version string.
pub fn remote_simulator_commit(version: &str) -> Option<&str> {
    version.split_once("git").map(|(_, commit)| commit.trim())
}

/// Baseline facts about the tools this run depends on.
#[derive(Debug, Clone)]
pub struct EnvironmentFacts {
    pub simulator: SimulatorVersion,
    pub zephyr_commit: String,
}

impl EnvironmentFacts {
    /// Probe the simulator and the Zephyr tree. Either one missing is fatal.
    pub async fn collect(config: &RunConfig) -> Result<Self> {
        let simulator = probe_simulator(&config.simulator_version).await?;
        let zephyr_commit = probe_zephyr_revision(&config.zephyr_path).await?;
        Ok(Self {
            simulator,
            zephyr_commit,
        })
    }

    /// Write `renode.version` and `zephyr.version` into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;
        fs::write(dir.join("renode.version"), &self.simulator.full).await?;
        fs::write(dir.join("zephyr.version"), &self.zephyr_commit).await?;
        Ok(())
    }
}

pub async fn probe_simulator(command: &CommandSpec) -> Result<SimulatorVersion> {
    let output = Command::new(&command.program)
        .args(&command.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|_| RunError::ToolMissing(command.program.clone()))?;

    let banner = String::from_utf8_lossy(&output.stdout);
    parse_simulator_version(&banner)
        .ok_or_else(|| RunError::ToolMissing(command.program.clone()).into())
}

pub async fn probe_zephyr_revision(zephyr_path: &Path) -> Result<String> {
    if !fs::try_exists(zephyr_path).await.unwrap_or(false) {
        return Err(RunError::ZephyrNotFound(zephyr_path.to_path_buf()).into());
    }
    let output = Command::new("git")
        .arg("-C")
        .arg(zephyr_path)
        .args(["rev-parse", "--short", "HEAD"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|_| RunError::ToolMissing("git".to_string()))?;

    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || commit.is_empty() {
        return Err(RunError::ZephyrNotFound(zephyr_path.to_path_buf()).into());
    }
    Ok(commit)
}

/// Which published work this run may reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReuseGates {
    /// Published simulation results may replace local runs.
    pub simulation: bool,
    /// Published build artifacts may replace local builds.
    pub builds: bool,
}

impl ReuseGates {
    pub async fn evaluate(
        facts: &EnvironmentFacts,
        store: &dyn ArtifactStore,
        config: &RunConfig,
    ) -> Result<Self> {
        let remote_simulator = fetch_remote_version(store, "renode").await?;
        let remote_commit = remote_simulator.as_deref().and_then(remote_simulator_commit);
        tracing::info!(
            "Comparing remote Renode commit {} with local {}.",
            remote_commit.unwrap_or("<none>"),
            facts.simulator.commit
        );
        let simulation = !config.force_sim && remote_commit == Some(facts.simulator.commit.as_str());

        let remote_zephyr = fetch_remote_version(store, "zephyr").await?;
        tracing::info!(
            "Comparing remote Zephyr commit {} with local {}.",
            remote_zephyr.as_deref().unwrap_or("<none>"),
            facts.zephyr_commit
        );
        let builds = !config.force_build && remote_zephyr.as_deref() == Some(facts.zephyr_commit.as_str());

        Ok(Self { simulation, builds })
    }
}
