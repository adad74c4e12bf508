use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{AggregateInput, ResultAggregator};
use crate::catalog::{board_full_name, board_toolchain, BoardCatalog, BoardInfo};
use crate::config::RunConfig;
use crate::core::{
    ArtifactKind, ArtifactPaths, BuildOutcome, BuildTarget, CpuDependencyChain, ResultRecord,
    SimulationOutcome, Toolchain,
};
use crate::detection::{select_primary_cpu, HardwareDescriptionAnalyzer, Translator};
use crate::environment::ReuseGates;
use crate::error::RunError;
use crate::intelligent_build::IntelligentBuilder;
use crate::jobs::{JobManager, ResultCollector, TargetJob};
use crate::remote::{download_artifacts, ArtifactStore, RemoteIndex};
use crate::reuse::RemoteReuseDecider;
use crate::simulation::{ReuseGate, SimulationReport, SimulationRunner};
use crate::BuildTool;

/// Artifacts a published build consists of.
pub const BUILD_ARTIFACTS: [ArtifactKind; 7] = [
    ArtifactKind::Elf,
    ArtifactKind::Dts,
    ArtifactKind::Config,
    ArtifactKind::ZephyrLog,
    ArtifactKind::SbomApp,
    ArtifactKind::SbomBuild,
    ArtifactKind::SbomZephyr,
];

/// Suffix published build artifacts are staged under until the set is
/// complete.
const STAGING_SUFFIX: &str = ".download";

/// Boards to process: every runnable catalog entry, or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardSelection {
    All,
    Named(Vec<String>),
}

impl BoardSelection {
    pub fn from_args(boards: Vec<String>) -> Self {
        if boards.is_empty() {
            BoardSelection::All
        } else {
            BoardSelection::Named(boards)
        }
    }

    /// Suffix of the results file name.
    pub fn label(&self) -> String {
        match self {
            BoardSelection::All => "all".to_string(),
            BoardSelection::Named(boards) => boards.join("_"),
        }
    }

    /// Board names in run order. Unknown names stop the run up front.
    pub fn resolve(&self, catalog: &BoardCatalog) -> Result<Vec<String>> {
        match self {
            BoardSelection::All => Ok(catalog
                .runnable()
                .into_iter()
                .map(|board| board.name.clone())
                .collect()),
            BoardSelection::Named(boards) => {
                for board in boards {
                    if catalog.get(board).is_none() {
                        return Err(RunError::UnknownBoard(board.clone()).into());
                    }
                }
                Ok(boards.clone())
            }
        }
    }
}

/// Per-target build, simulate and aggregate, plus the worker pool that runs
/// it over many boards.
pub struct Pipeline {
    config: Arc<RunConfig>,
    catalog: Arc<BoardCatalog>,
    store: Arc<dyn ArtifactStore>,
    analyzer: Arc<HardwareDescriptionAnalyzer>,
    builder: IntelligentBuilder,
    simulator: SimulationRunner,
    decider: RemoteReuseDecider,
    aggregator: ResultAggregator,
    index: RemoteIndex,
    gates: ReuseGates,
}

impl Pipeline {
    pub fn new(
        config: Arc<RunConfig>,
        catalog: Arc<BoardCatalog>,
        tool: Arc<dyn BuildTool>,
        translator: Arc<dyn Translator>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let analyzer = Arc::new(HardwareDescriptionAnalyzer::new(
            translator.clone(),
            config.flash_alias.clone(),
        ));
        Self {
            builder: IntelligentBuilder::new(tool, analyzer.clone()),
            simulator: SimulationRunner::new(config.clone(), translator),
            decider: RemoteReuseDecider::new(store.clone()),
            aggregator: ResultAggregator::new(),
            index: RemoteIndex::empty(),
            gates: ReuseGates::default(),
            config,
            catalog,
            store,
            analyzer,
        }
    }

    /// Enable reuse of published work. The index is only consulted when the
    /// simulation gate is open.
    pub fn with_remote(mut self, index: RemoteIndex, gates: ReuseGates) -> Self {
        self.index = if gates.simulation {
            index
        } else {
            RemoteIndex::empty()
        };
        self.gates = gates;
        self
    }

    pub async fn build_target(&self, board: &BoardInfo, toolchain: Toolchain) -> Result<BuildTarget> {
        let sample = self.config.sample;
        let mut extra_build_args = Vec::new();

        let extra_conf = self.config.configs_dir.join(format!("{}.conf", sample.name()));
        if fs::try_exists(&extra_conf).await.unwrap_or(false) {
            let extra_conf = fs::canonicalize(&extra_conf)
                .await
                .with_context(|| format!("Failed to resolve {:?}", extra_conf))?;
            extra_build_args.push(format!("-DCONF_FILE={}", extra_conf.display()));
        }

        Ok(BuildTarget {
            board_id: board.name.clone(),
            sample,
            sample_source_path: PathBuf::from(sample.source_path()),
            extra_build_args,
            toolchain,
        })
    }

    /// Run one board to completion. Only environment faults are errors.
    pub async fn run_target(&self, board_name: &str) -> Result<ResultRecord> {
        let board = self
            .catalog
            .get(board_name)
            .ok_or_else(|| RunError::UnknownBoard(board_name.to_string()))?;
        let zephyr = &self.config.zephyr_path;
        let paths = ArtifactPaths::new(&self.config.artifacts_dir, &board.name, self.config.sample);
        fs::create_dir_all(paths.dir())
            .await
            .with_context(|| format!("Failed to create {:?}", paths.dir()))?;

        let yaml = board.yaml_path(zephyr);
        let target = self.build_target(board, board_toolchain(&yaml)).await?;
        let build_outcome = self.build(&target, &paths).await?;

        let cpu_chain = self
            .analyzer
            .derive_cpu_chain(&board.arch, &board.dts_path(zephyr))
            .await?;
        let built_dts = paths.path(ArtifactKind::Dts);
        let console = if exists(&built_dts).await {
            self.analyzer.derive_console_device(&built_dts).await?
        } else {
            None
        };

        let simulation = if exists(&paths.path(ArtifactKind::Elf)).await {
            Some(self.simulate(&paths, &built_dts, console.as_deref(), &cpu_chain).await?)
        } else {
            if console.is_none() {
                tracing::info!("No uart. Cannot run test.");
            }
            None
        };

        let original_flash_capacity = if exists(&paths.dts_backup()).await {
            self.analyzer
                .flash_region(&paths.dts_backup())
                .await
                .map(|region| region.size_bytes)
        } else {
            None
        };

        self.aggregator
            .aggregate(
                &paths,
                AggregateInput {
                    board_name: board.name.clone(),
                    board_path: board.path.clone(),
                    arch: Some(board.arch.clone()),
                    board_full_name: Some(board_full_name(&yaml)),
                    cpu: Some(select_primary_cpu(&cpu_chain)),
                    build_outcome,
                    simulation: simulation.as_ref().map(|report| report.outcome),
                    console_device: console,
                    generated_topology: simulation
                        .as_ref()
                        .is_some_and(|report| report.generated_topology),
                    original_flash_capacity,
                },
            )
            .await
    }

    async fn build(&self, target: &BuildTarget, paths: &ArtifactPaths) -> Result<BuildOutcome> {
        if self.gates.builds {
            remove_if_exists(&paths.dts_backup()).await?;
            if self.fetch_published_build(paths).await? {
                return Ok(BuildOutcome::Built);
            }
            tracing::info!("Artifact not found! Trying to build it locally.");
        }

        let report = self.builder.execute_with_fallbacks(target, paths).await?;
        let log_path = paths.path(ArtifactKind::ZephyrLog);
        if !report.attempts.is_empty() && !non_empty(&log_path).await {
            fs::write(&log_path, report.last_log())
                .await
                .with_context(|| format!("Failed to write {:?}", log_path))?;
        }
        Ok(report.outcome)
    }

    /// Install the published build only when every artifact of it exists, so
    /// a partial download never stands in for a local build.
    async fn fetch_published_build(&self, paths: &ArtifactPaths) -> Result<bool> {
        let complete =
            download_artifacts(self.store.as_ref(), paths, &BUILD_ARTIFACTS, STAGING_SUFFIX)
                .await?;

        for kind in BUILD_ARTIFACTS {
            let staged = paths.with_suffix(kind, STAGING_SUFFIX);
            if complete {
                let dest = paths.path(kind);
                fs::rename(&staged, &dest)
                    .await
                    .with_context(|| format!("Failed to install {:?}", dest))?;
            } else {
                remove_if_exists(&staged).await?;
            }
        }
        Ok(complete)
    }

    async fn simulate(
        &self,
        paths: &ArtifactPaths,
        hw_desc: &Path,
        console: Option<&str>,
        cpu_chain: &CpuDependencyChain,
    ) -> Result<SimulationReport> {
        let gate = (!self.index.is_empty()).then(|| ReuseGate {
            decider: &self.decider,
            index: &self.index,
        });
        match self.simulator.run(paths, hw_desc, console, cpu_chain, gate).await {
            Ok(report) => Ok(report),
            Err(e) if e.downcast_ref::<RunError>().is_some() => Err(e),
            Err(e) => {
                tracing::warn!("Simulation of {} could not be prepared: {:#}", paths.board(), e);
                Ok(SimulationReport {
                    outcome: SimulationOutcome::Failed,
                    signals_sent: Vec::new(),
                    generated_topology: false,
                })
            }
        }
    }

    /// Run every board on a pool of `config.jobs` workers. The first
    /// environment fault cancels the remaining work.
    pub async fn run_all(self: Arc<Self>, boards: Vec<String>) -> Result<Vec<ResultRecord>> {
        let total = boards.len();
        let jobs = JobManager::new();
        let collector = ResultCollector::new();
        let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));
        let mut workers = JoinSet::new();

        for (position, board) in boards.into_iter().enumerate() {
            let index = position + 1;
            let job_id = jobs.submit_job(TargetJob::new(index, board.clone()));
            let pipeline = self.clone();
            let jobs = jobs.clone();
            let collector = collector.clone();
            let semaphore = semaphore.clone();

            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Worker pool closed")?;
                jobs.update_job(&job_id, |job| job.start())?;
                if total > 1 {
                    tracing::info!(">> [{} / {}] -- {} --", index, total, board);
                }

                match pipeline.run_target(&board).await {
                    Ok(record) => {
                        tracing::info!("{}: {}", board, record.status);
                        jobs.update_job(&job_id, |job| job.complete(record.status))?;
                        collector.push(index, record);
                    }
                    Err(e) => {
                        jobs.update_job(&job_id, |job| job.fail(format!("{:#}", e)))?;
                        return Err(e.context(format!("Board {} aborted the run", board)));
                    }
                }

                if total > 1 {
                    tracing::info!("<< [{} / {}] -- {} --", index, total, board);
                }
                Ok::<(), anyhow::Error>(())
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined.context("Worker task panicked")? {
                workers.abort_all();
                tracing::error!("{:#}", e);
                return Err(e);
            }
        }

        let summary = jobs.summary();
        tracing::info!(
            "Finished {} boards: {} passed, {} built, {} not built",
            summary.total,
            summary.passed,
            summary.built,
            summary.not_built
        );
        Ok(collector.into_sorted())
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn non_empty(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}
