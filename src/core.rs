use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::RunError;

/// Sample firmware images the pipeline knows how to build and script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sample {
    HelloWorld,
    ShellModule,
    Philosophers,
    Micropython,
    TensorflowLiteMicro,
}

impl Sample {
    pub const ALL: [Sample; 5] = [
        Sample::HelloWorld,
        Sample::ShellModule,
        Sample::Philosophers,
        Sample::Micropython,
        Sample::TensorflowLiteMicro,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Sample::HelloWorld => "hello_world",
            Sample::ShellModule => "shell_module",
            Sample::Philosophers => "philosophers",
            Sample::Micropython => "micropython",
            Sample::TensorflowLiteMicro => "tensorflow_lite_micro",
        }
    }

    /// Path of the sample sources relative to the Zephyr `samples/` directory.
    pub fn source_path(&self) -> &'static str {
        match self {
            Sample::HelloWorld => "hello_world",
            Sample::ShellModule => "subsys/shell/shell_module",
            Sample::Philosophers => "philosophers",
            Sample::Micropython => "../../../micropython/ports/zephyr",
            Sample::TensorflowLiteMicro => "modules/tflite-micro/hello_world",
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Sample {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sample::ALL
            .iter()
            .copied()
            .find(|sample| sample.name() == s)
            .ok_or_else(|| RunError::UnknownSample(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Toolchain {
    Zephyr,
    Espressif,
    Other(String),
}

impl Toolchain {
    pub fn parse(name: &str) -> Self {
        match name {
            "zephyr" => Toolchain::Zephyr,
            "espressif" => Toolchain::Espressif,
            other => Toolchain::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toolchain::Zephyr => f.write_str("zephyr"),
            Toolchain::Espressif => f.write_str("espressif"),
            Toolchain::Other(name) => f.write_str(name),
        }
    }
}

/// One build/simulate unit. Fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub board_id: String,
    pub sample: Sample,
    pub sample_source_path: PathBuf,
    pub extra_build_args: Vec<String>,
    pub toolchain: Toolchain,
}

/// A memory range declared in the hardware description, keyed by its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub name: String,
    pub base_address: u64,
    pub size_bytes: u64,
}

/// CPU model aliases ordered from most to least specific.
///
/// Entries starting with `!` are disabled or virtual and never chosen as the
/// primary CPU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDependencyChain(pub Vec<String>);

impl CpuDependencyChain {
    pub const NEGATION_MARKER: char = '!';

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First non-negated entry in chain order, or an empty string.
    pub fn primary(&self) -> &str {
        self.0
            .iter()
            .find(|cpu| !cpu.starts_with(Self::NEGATION_MARKER))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Overlay list handed to the translator: the chain followed by the board.
    pub fn overlays_for(&self, board_id: &str) -> String {
        self.0
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(board_id))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildOutcome {
    NotBuilt,
    Built,
    FailedOverflow,
    FailedOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationOutcome {
    SkippedNoConsole,
    SkippedReused { remote_passed: bool },
    Passed,
    Failed,
    TimedOut,
}

impl SimulationOutcome {
    pub fn passed(&self) -> bool {
        matches!(
            self,
            SimulationOutcome::Passed | SimulationOutcome::SkippedReused { remote_passed: true }
        )
    }
}

/// Persisted per-board status. Simulation failures and timeouts on a built
/// target are reported as `Built`; downstream consumers rely on exactly these
/// three strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    #[serde(rename = "NOT BUILT")]
    NotBuilt,
    #[serde(rename = "BUILT")]
    Built,
    #[serde(rename = "PASSED")]
    Passed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::NotBuilt => "NOT BUILT",
            ResultStatus::Built => "BUILT",
            ResultStatus::Passed => "PASSED",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    #[serde(rename = "used")]
    pub used_bytes: u64,
    #[serde(rename = "size")]
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub board_name: String,
    pub board_path: String,
    pub sample_name: String,
    pub status: ResultStatus,
    pub uart_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repl_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repl_name: Option<String>,
    #[serde(default)]
    pub files: Vec<ArtifactKind>,
    #[serde(default)]
    pub memory: BTreeMap<String, MemoryUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Asciinema,
    Config,
    Dts,
    Elf,
    Log,
    Monitor,
    Profiling,
    Repl,
    Resc,
    Robot,
    Save,
    SbomApp,
    SbomBuild,
    SbomZephyr,
    Zip,
    ZipSbom,
    ZephyrLog,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 17] = [
        ArtifactKind::Asciinema,
        ArtifactKind::Config,
        ArtifactKind::Dts,
        ArtifactKind::Elf,
        ArtifactKind::Log,
        ArtifactKind::Monitor,
        ArtifactKind::Profiling,
        ArtifactKind::Repl,
        ArtifactKind::Resc,
        ArtifactKind::Robot,
        ArtifactKind::Save,
        ArtifactKind::SbomApp,
        ArtifactKind::SbomBuild,
        ArtifactKind::SbomZephyr,
        ArtifactKind::Zip,
        ArtifactKind::ZipSbom,
        ArtifactKind::ZephyrLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Asciinema => "asciinema",
            ArtifactKind::Config => "config",
            ArtifactKind::Dts => "dts",
            ArtifactKind::Elf => "elf",
            ArtifactKind::Log => "log",
            ArtifactKind::Monitor => "monitor",
            ArtifactKind::Profiling => "profiling",
            ArtifactKind::Repl => "repl",
            ArtifactKind::Resc => "resc",
            ArtifactKind::Robot => "robot",
            ArtifactKind::Save => "save",
            ArtifactKind::SbomApp => "sbom-app",
            ArtifactKind::SbomBuild => "sbom-build",
            ArtifactKind::SbomZephyr => "sbom-zephyr",
            ArtifactKind::Zip => "zip",
            ArtifactKind::ZipSbom => "zip-sbom",
            ArtifactKind::ZephyrLog => "zephyr-log",
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, ArtifactKind::Zip | ArtifactKind::ZipSbom)
    }

    pub fn file_name(&self, board: &str, sample: &str) -> String {
        match self {
            ArtifactKind::Asciinema => format!("{board}-{sample}-asciinema"),
            ArtifactKind::Config => format!("{board}-{sample}-config"),
            ArtifactKind::Dts => format!("{board}-{sample}.dts"),
            ArtifactKind::Elf => format!("{board}-zephyr-{sample}.elf"),
            ArtifactKind::Log => format!("{board}-{sample}.html"),
            ArtifactKind::Monitor => format!("{board}-{sample}_monitor.txt"),
            ArtifactKind::Profiling => format!("{board}-{sample}-profile"),
            ArtifactKind::Repl => format!("{board}-{sample}.repl"),
            ArtifactKind::Resc => format!("{board}-{sample}.resc"),
            ArtifactKind::Robot => format!("{board}-{sample}.robot"),
            ArtifactKind::Save => format!("{board}-{sample}.{sample}_on_{board}.fail.save"),
            ArtifactKind::SbomApp => format!("{board}-{sample}-app.spdx"),
            ArtifactKind::SbomBuild => format!("{board}-{sample}-build.spdx"),
            ArtifactKind::SbomZephyr => format!("{board}-{sample}-zephyr.spdx"),
            ArtifactKind::Zip => format!("{board}-{sample}.zip"),
            ArtifactKind::ZipSbom => format!("{board}-{sample}-sbom.zip"),
            ArtifactKind::ZephyrLog => format!("{board}-{sample}-zephyr.log"),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact locations for one (board, sample) pair.
///
/// The directory is `<root>/<board>-<sample>` and is owned by a single worker
/// for the duration of a run.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    board: String,
    sample: Sample,
    dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: &Path, board: &str, sample: Sample) -> Self {
        Self {
            board: board.to_string(),
            sample,
            dir: root.join(Self::directory_name(board, sample)),
        }
    }

    pub fn directory_name(board: &str, sample: Sample) -> String {
        format!("{}-{}", board, sample.name())
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn sample(&self) -> Sample {
        self.sample
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name(&self.board, self.sample.name()))
    }

    pub fn with_suffix(&self, kind: ArtifactKind, suffix: &str) -> PathBuf {
        let mut name = self.path(kind).into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Store key: `{board}-{sample}/{file name}`.
    pub fn remote_key(&self, kind: ArtifactKind) -> String {
        format!(
            "{}/{}",
            Self::directory_name(&self.board, self.sample),
            kind.file_name(&self.board, self.sample.name())
        )
    }

    /// Backup of the hardware description taken before a flash enlargement.
    pub fn dts_backup(&self) -> PathBuf {
        self.with_suffix(ArtifactKind::Dts, ".orig")
    }

    /// Artifact kinds whose file exists and is non-empty, archives excluded.
    pub fn present_artifacts(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .iter()
            .copied()
            .filter(|kind| !kind.is_archive())
            .filter(|kind| {
                std::fs::metadata(self.path(*kind))
                    .map(|meta| meta.is_file() && meta.len() > 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}
