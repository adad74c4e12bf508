use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use firmware_sim_runner::aggregate::{results_path, write_results};
use firmware_sim_runner::catalog::BoardCatalog;
use firmware_sim_runner::config::RunConfig;
use firmware_sim_runner::detection::Dts2ReplTranslator;
use firmware_sim_runner::environment::{EnvironmentFacts, ReuseGates};
use firmware_sim_runner::pipeline::{BoardSelection, Pipeline};
use firmware_sim_runner::remote::{HttpArtifactStore, RemoteIndex};
use firmware_sim_runner::ScriptBuildTool;

#[derive(Debug, Parser)]
#[command(name = "firmware-sim-runner", version, about = "Build Zephyr samples and test them in simulation")]
struct Cli {
    /// Boards to process. Every runnable board in the catalog when omitted.
    boards: Vec<String>,

    /// YAML run configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML board catalog: a list of `name`, `arch` and `path` entries.
    #[arg(long, default_value = "boards.yaml")]
    catalog: PathBuf,

    /// Sample to build, overrides SAMPLE_NAME.
    #[arg(short, long)]
    sample: Option<String>,

    /// Parallel workers, overrides SIM_JOBS.
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Always simulate, ignoring published results.
    #[arg(long)]
    force_sim: bool,

    /// Always build locally, ignoring published artifacts.
    #[arg(long)]
    force_build: bool,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    #[arg(long)]
    zephyr_path: Option<PathBuf>,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        }
        .apply_env()?;

        if let Some(sample) = &self.sample {
            config.sample = sample.parse()?;
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = dir.clone();
        }
        if let Some(path) = &self.zephyr_path {
            config.zephyr_path = path.clone();
        }
        config.force_sim |= self.force_sim;
        config.force_build |= self.force_build;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(cli.run_config()?);
    let selection = BoardSelection::from_args(cli.boards.clone());
    match &selection {
        BoardSelection::All => info!("Running dashboard generation for all boards."),
        BoardSelection::Named(boards) => info!(
            "Running dashboard generation for the selected boards: {}.",
            boards.join(", ")
        ),
    }

    let facts = EnvironmentFacts::collect(&config).await?;
    facts.write(&config.artifacts_dir).await?;

    let catalog = Arc::new(BoardCatalog::from_file(&cli.catalog)?);
    let boards = selection.resolve(&catalog)?;

    let store = Arc::new(HttpArtifactStore::new(config.dashboard_url.clone()));
    let gates = ReuseGates::evaluate(&facts, store.as_ref(), &config).await?;
    let index = if gates.simulation {
        RemoteIndex::fetch(store.as_ref(), config.sample).await?
    } else {
        RemoteIndex::empty()
    };
    info!(
        "Sample {}: {} boards, {} published results",
        config.sample,
        boards.len(),
        index.len()
    );

    let translator = Arc::new(Dts2ReplTranslator::new(
        config.translator.clone(),
        config.zephyr_path.clone(),
    ));
    let tool = Arc::new(ScriptBuildTool::new(config.build_script.clone()));
    let pipeline = Arc::new(
        Pipeline::new(config.clone(), catalog, tool, translator, store).with_remote(index, gates),
    );

    let records = pipeline.run_all(boards).await?;

    let path = results_path(&config.results_dir(), config.sample.name(), &selection.label());
    write_results(&path, &records)
        .await
        .with_context(|| format!("Failed to write results for {}", config.sample))?;
    info!("Wrote {} results to {:?}", records.len(), path);

    Ok(())
}
