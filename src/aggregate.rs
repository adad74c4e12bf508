use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;

use crate::core::{
    ArtifactKind, ArtifactPaths, BuildOutcome, MemoryUsage, ResultRecord, ResultStatus,
    SimulationOutcome,
};

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?P<region>\w+):\s*(?P<used>\d+\s+\w{1,2})\s*(?P<size>\d+\s+\w{1,2})\s*(?P<percentage>\d+.\d+%)",
        )
        .expect("valid memory usage pattern")
    })
}

/// Convert `"<n> <unit>"` with unit B, KB, MB or GB into bytes.
pub fn parse_memory_size(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: u64 = parts.next()?.parse().ok()?;
    let multiplier: u64 = match parts.next()? {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

/// Memory usage table printed by the linker step of the build.
pub fn parse_memory_usage(log: &str) -> BTreeMap<String, MemoryUsage> {
    let mut memory = BTreeMap::new();
    for caps in memory_pattern().captures_iter(log) {
        let used = parse_memory_size(&caps["used"]);
        let size = parse_memory_size(&caps["size"]);
        match (used, size) {
            (Some(used_bytes), Some(capacity_bytes)) => {
                memory.insert(
                    caps["region"].to_string(),
                    MemoryUsage {
                        used_bytes,
                        capacity_bytes,
                    },
                );
            }
            _ => tracing::debug!("Skipping memory line for region {}", &caps["region"]),
        }
    }
    memory
}

/// Three-state roll-up. Anything short of a pass on a built target is
/// `Built`.
pub fn rollup_status(binary_present: bool, simulation: Option<SimulationOutcome>) -> ResultStatus {
    if !binary_present {
        return ResultStatus::NotBuilt;
    }
    match simulation {
        Some(outcome) if outcome.passed() => ResultStatus::Passed,
        _ => ResultStatus::Built,
    }
}

/// Everything known about a target once building and simulating are done.
#[derive(Debug, Clone)]
pub struct AggregateInput {
    pub board_name: String,
    pub board_path: String,
    pub arch: Option<String>,
    pub board_full_name: Option<String>,
    pub cpu: Option<String>,
    pub build_outcome: BuildOutcome,
    pub simulation: Option<SimulationOutcome>,
    pub console_device: Option<String>,
    pub generated_topology: bool,
    /// Flash capacity before any enlargement, when the build was retried.
    pub original_flash_capacity: Option<u64>,
}

pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Fold one target into its result record. Files in the artifact
    /// directory are the source of truth for the binary and the build log.
    pub async fn aggregate(&self, paths: &ArtifactPaths, input: AggregateInput) -> Result<ResultRecord> {
        let binary_present = fs::try_exists(paths.path(ArtifactKind::Elf))
            .await
            .unwrap_or(false);
        let status = rollup_status(binary_present, input.simulation);
        tracing::debug!(
            "{}: build {:?}, simulation {:?} -> {}",
            input.board_name,
            input.build_outcome,
            input.simulation,
            status
        );

        if status == ResultStatus::Passed {
            let save = paths.path(ArtifactKind::Save);
            match fs::remove_file(&save).await {
                Ok(()) => tracing::debug!("Removed stale snapshot {:?}", save),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {:?}", save)),
            }
        }

        let mut memory = BTreeMap::new();
        if status != ResultStatus::NotBuilt {
            let log = fs::read_to_string(paths.path(ArtifactKind::ZephyrLog))
                .await
                .unwrap_or_default();
            memory = parse_memory_usage(&log);
            if let (Some(capacity), Some(flash)) =
                (input.original_flash_capacity, memory.get_mut("FLASH"))
            {
                flash.capacity_bytes = capacity;
            }
        }

        let (repl_type, repl_name) = if input.generated_topology {
            (
                Some("AUTO".to_string()),
                Some(ArtifactKind::Repl.file_name(paths.board(), paths.sample().name())),
            )
        } else {
            (None, None)
        };

        let files = paths.present_artifacts();
        write_archives(paths, &files).await?;

        Ok(ResultRecord {
            board_name: input.board_name,
            board_path: input.board_path,
            sample_name: paths.sample().name().to_string(),
            status,
            uart_name: input.console_device.unwrap_or_default(),
            arch: input.arch,
            board_full_name: input.board_full_name,
            cpu: input.cpu,
            repl_type,
            repl_name,
            files,
            memory,
        })
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

pub const SBOM_ARTIFACTS: [ArtifactKind; 3] = [
    ArtifactKind::SbomApp,
    ArtifactKind::SbomZephyr,
    ArtifactKind::SbomBuild,
];

/// Pack the listed artifacts into the target's zip and the SBOMs into the
/// SBOM zip. Entries are stored as `{board}-{sample}/{file}`.
pub async fn write_archives(paths: &ArtifactPaths, files: &[ArtifactKind]) -> Result<()> {
    let bundles = vec![
        (paths.path(ArtifactKind::Zip), files.to_vec()),
        (paths.path(ArtifactKind::ZipSbom), SBOM_ARTIFACTS.to_vec()),
    ];
    let paths = paths.clone();
    tokio::task::spawn_blocking(move || {
        for (archive, kinds) in bundles {
            write_archive(&archive, &paths, &kinds)?;
        }
        Ok::<(), anyhow::Error>(())
    })
    .await
    .context("Archive task panicked")?
}

fn write_archive(archive: &Path, paths: &ArtifactPaths, kinds: &[ArtifactKind]) -> Result<()> {
    let file = std::fs::File::create(archive)
        .with_context(|| format!("Failed to create {:?}", archive))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let prefix = ArtifactPaths::directory_name(paths.board(), paths.sample());

    for kind in kinds {
        let source = paths.path(*kind);
        let Ok(bytes) = std::fs::read(&source) else {
            continue;
        };
        let name = kind.file_name(paths.board(), paths.sample().name());
        zip.start_file(format!("{}/{}", prefix, name), options)?;
        zip.write_all(&bytes)?;
    }
    zip.finish()
        .with_context(|| format!("Failed to finish {:?}", archive))?;
    Ok(())
}

/// `results-{sample}_{selection}.json` inside `dir`.
pub fn results_path(dir: &Path, sample: &str, selection: &str) -> PathBuf {
    dir.join(format!("results-{}_{}.json", sample, selection))
}

pub async fn write_results(path: &Path, records: &[ResultRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let json = serde_json::to_vec(records)?;
    fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}
