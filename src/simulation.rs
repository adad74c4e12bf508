use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::{Child, Command};

use crate::config::RunConfig;
use crate::core::{ArtifactKind, ArtifactPaths, CpuDependencyChain, SimulationOutcome};
use crate::detection::Translator;
use crate::error::RunError;
use crate::remote::RemoteIndex;
use crate::render::{self, ControlScript, TestScript};
use crate::reuse::{RemoteReuseDecider, ReuseDecision};

/// Files the simulator leaves in its working directory.
const MONITOR_FILE: &str = "monitor.txt";
const REPORT_FILE: &str = "log.html";
const REPORT_DIR: &str = "logs";

/// Simulator flag that kills every other simulator instance on the host.
const KILL_STALE_FLAG: &str = "--kill-stale-renode-instances";

/// Grace period for the process group to exit after the final signal.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Signals sent to the simulator's process group when it overruns.
pub const SHUTDOWN_SEQUENCE: [i32; 3] = [libc::SIGINT, libc::SIGINT, libc::SIGTERM];

/// Value of a `KEY="value"` line in a Kconfig output file.
pub fn config_value(config: &str, key: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#"{}="(.*)""#, regex::escape(key))).ok()?;
    pattern
        .captures(config)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Make relative `roots` resolve from `work_dir` as they do from `base` by
/// linking their first path component. Returns the links created.
pub async fn link_relative_roots(
    work_dir: &Path,
    base: &Path,
    roots: &[&Path],
) -> Result<Vec<PathBuf>> {
    let mut links = Vec::new();
    for root in roots {
        let Some(Component::Normal(first)) = root.components().next() else {
            continue;
        };
        let link = work_dir.join(first);
        if links.contains(&link) || fs::symlink_metadata(&link).await.is_ok() {
            continue;
        }
        fs::symlink(base.join(first), &link)
            .await
            .with_context(|| format!("Failed to link {:?}", link))?;
        links.push(link);
    }
    Ok(links)
}

/// Keep only the first `limit` lines of a console transcript.
pub fn truncate_transcript(text: &str, limit: usize) -> String {
    text.split('\n').take(limit).collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone)]
pub struct PreparedSimulation {
    pub test_script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub outcome: SimulationOutcome,
    /// Signals delivered to the process group, in order.
    pub signals_sent: Vec<i32>,
    /// Whether a machine description was generated for this run.
    pub generated_topology: bool,
}

impl SimulationReport {
    fn without_run(outcome: SimulationOutcome, generated_topology: bool) -> Self {
        Self {
            outcome,
            signals_sent: Vec::new(),
            generated_topology,
        }
    }
}

/// Optional check against published results before launching the simulator.
pub struct ReuseGate<'a> {
    pub decider: &'a RemoteReuseDecider,
    pub index: &'a RemoteIndex,
}

pub struct SimulationRunner {
    config: Arc<RunConfig>,
    translator: Arc<dyn Translator>,
}

impl SimulationRunner {
    pub fn new(config: Arc<RunConfig>, translator: Arc<dyn Translator>) -> Self {
        Self { config, translator }
    }

    pub async fn run(
        &self,
        paths: &ArtifactPaths,
        hw_desc: &Path,
        console: Option<&str>,
        cpu_chain: &CpuDependencyChain,
        reuse: Option<ReuseGate<'_>>,
    ) -> Result<SimulationReport> {
        let Some(console) = console else {
            tracing::info!("No uart. Cannot run test.");
            return Ok(SimulationReport::without_run(SimulationOutcome::SkippedNoConsole, false));
        };

        tracing::info!(
            "Autogenerating repl for {} using device tree.",
            paths.board()
        );
        let prepared = self.prepare(paths, hw_desc, console, cpu_chain).await?;

        if let Some(gate) = reuse {
            if let ReuseDecision::ReuseRemote { remote_passed } =
                gate.decider.decide(paths, gate.index).await?
            {
                return Ok(SimulationReport::without_run(
                    SimulationOutcome::SkippedReused { remote_passed },
                    true,
                ));
            }
        }

        self.launch(paths, &prepared).await
    }

    /// Write the machine description, control script and test script.
    pub async fn prepare(
        &self,
        paths: &ArtifactPaths,
        hw_desc: &Path,
        console: &str,
        cpu_chain: &CpuDependencyChain,
    ) -> Result<PreparedSimulation> {
        let board = paths.board();
        let sample = paths.sample();

        let topology = self
            .translator
            .machine_topology(hw_desc, &cpu_chain.overlays_for(board))
            .await?;
        let repl = paths.path(ArtifactKind::Repl);
        fs::write(&repl, &topology)
            .await
            .with_context(|| format!("Failed to write {:?}", repl))?;

        let post_boot = render::post_boot_command(&topology, board, sample);
        let resc = paths.path(ArtifactKind::Resc);
        let control = ControlScript {
            board,
            sample,
            platform: &repl,
            elf: &paths.path(ArtifactKind::Elf),
            console,
            post_boot: post_boot.as_deref(),
        }
        .render();
        fs::write(&resc, control)
            .await
            .with_context(|| format!("Failed to write {:?}", resc))?;

        let config_board = match fs::read_to_string(paths.path(ArtifactKind::Config)).await {
            Ok(text) => config_value(&text, "CONFIG_BOARD"),
            Err(_) => None,
        }
        .unwrap_or_else(|| {
            tracing::warn!("CONFIG_BOARD not found for {}, using the board name", board);
            board.to_string()
        });

        let robot = paths.path(ArtifactKind::Robot);
        let test = TestScript {
            board,
            config_board: &config_board,
            console,
            sample,
            control_script: &resc,
        }
        .render();
        fs::write(&robot, test)
            .await
            .with_context(|| format!("Failed to write {:?}", robot))?;

        Ok(PreparedSimulation { test_script: robot })
    }

    /// Run the test script under the configured timeout and collect logs.
    pub async fn launch(
        &self,
        paths: &ArtifactPaths,
        prepared: &PreparedSimulation,
    ) -> Result<SimulationReport> {
        let simulator = &self.config.simulator;
        let script = fs::canonicalize(&prepared.test_script)
            .await
            .with_context(|| format!("Missing test script {:?}", prepared.test_script))?;

        tracing::info!(
            "Run this interactively using: renode {}",
            paths.path(ArtifactKind::Resc).display()
        );

        // Workers never share a working directory or kill each other's runs.
        // Scripts name artifacts relative to the invocation directory.
        let work_dir = self.work_dir(paths);
        fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", work_dir))?;
        let base = std::env::current_dir().context("Failed to read the current directory")?;
        let links = link_relative_roots(
            &work_dir,
            &base,
            &[
                self.config.artifacts_dir.as_path(),
                self.config.snapshots_dir.as_path(),
            ],
        )
        .await?;
        let parallel = self.config.jobs > 1;
        let args = simulator
            .args
            .iter()
            .filter(|arg| !(parallel && arg.as_str() == KILL_STALE_FLAG));

        let mut child = Command::new(&simulator.program)
            .args(args)
            .arg(&script)
            .current_dir(&work_dir)
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: simulator.program.clone(),
                source,
            })?;
        let pgid = child.id().map(|pid| pid as i32);

        let mut signals_sent = Vec::new();
        let outcome = match tokio::time::timeout(self.config.sim_timeout(), child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for the simulator")?;
                if status.success() {
                    SimulationOutcome::Passed
                } else {
                    SimulationOutcome::Failed
                }
            }
            Err(_) => {
                tracing::warn!(
                    "Timeout running tests for {}-{}",
                    paths.board(),
                    paths.sample()
                );
                signals_sent = shutdown_group(&mut child, pgid).await?;
                SimulationOutcome::TimedOut
            }
        };

        self.recover_logs(paths, &work_dir).await?;
        for link in links {
            let _ = fs::remove_file(link).await;
        }
        let _ = fs::remove_dir(&work_dir).await;

        match outcome {
            SimulationOutcome::Passed => tracing::info!("PASSED: test passed on {}", paths.board()),
            SimulationOutcome::TimedOut => tracing::info!("TIMED OUT: test failed on {}", paths.board()),
            _ => tracing::info!("FAILED: test failed on {}", paths.board()),
        }

        Ok(SimulationReport {
            outcome,
            signals_sent,
            generated_topology: true,
        })
    }

    /// Simulator working directory of one target, under the configured root.
    pub fn work_dir(&self, paths: &ArtifactPaths) -> PathBuf {
        self.config
            .sim_work_dir
            .join(ArtifactPaths::directory_name(paths.board(), paths.sample()))
    }

    /// Copy the failure snapshot, truncated console transcript and report into
    /// the artifact directory, then clear the simulator's working files.
    async fn recover_logs(&self, paths: &ArtifactPaths, work_dir: &Path) -> Result<()> {

        let save = paths.path(ArtifactKind::Save);
        if let Some(name) = save.file_name() {
            let snapshot = self.config.snapshots_dir.join(name);
            if fs::try_exists(&snapshot).await.unwrap_or(false) {
                fs::copy(&snapshot, &save)
                    .await
                    .with_context(|| format!("Failed to copy snapshot {:?}", snapshot))?;
            }
        }

        let monitor = work_dir.join(MONITOR_FILE);
        if let Ok(bytes) = fs::read(&monitor).await {
            let text = String::from_utf8_lossy(&bytes);
            let truncated = truncate_transcript(&text, self.config.monitor_line_limit);
            let dest = paths.path(ArtifactKind::Monitor);
            fs::write(&dest, truncated)
                .await
                .with_context(|| format!("Failed to write {:?}", dest))?;
        }

        let report = work_dir.join(REPORT_FILE);
        if !fs::try_exists(&report).await.unwrap_or(false) {
            tokio::time::sleep(self.config.log_grace()).await;
        }
        if fs::try_exists(&report).await.unwrap_or(false) {
            let dest = paths.path(ArtifactKind::Log);
            fs::copy(&report, &dest)
                .await
                .with_context(|| format!("Failed to copy {:?}", report))?;
        }

        for name in [REPORT_FILE, MONITOR_FILE] {
            let _ = fs::remove_file(work_dir.join(name)).await;
        }
        let _ = fs::remove_dir_all(work_dir.join(REPORT_DIR)).await;
        Ok(())
    }
}

/// Interrupt the process group twice, then terminate it, and reap the child.
async fn shutdown_group(child: &mut Child, pgid: Option<i32>) -> Result<Vec<i32>> {
    let mut sent = Vec::new();
    if let Some(pgid) = pgid {
        for signal in SHUTDOWN_SEQUENCE {
            if signal_group(pgid, signal)? {
                sent.push(signal);
            }
        }
    }

    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        tracing::warn!("Simulator ignored termination, killing it");
        child.kill().await.context("Failed to kill the simulator")?;
    }
    Ok(sent)
}

/// Returns `false` when the group no longer exists.
fn signal_group(pgid: i32, signal: i32) -> Result<bool, RunError> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(RunError::Signal { pgid, source: err })
    }
}
