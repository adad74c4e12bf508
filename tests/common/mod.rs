#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use firmware_sim_runner::{
    config::{CommandSpec, RunConfig},
    core::{ArtifactKind, ArtifactPaths, BuildTarget},
    detection::Translator,
    execution::BuildAttempt,
    remote::ArtifactStore,
    BuildTool,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const MEMORY_LOG: &str = "\
Memory region         Used Size  Region Size  %age Used
           FLASH:       13192 B       256 KB      5.03%
             RAM:        4032 B        64 KB      6.15%
";

pub fn dts_with_flash(size: u64) -> String {
    format!(
        "/ {{\n\tchosen {{\n\t\tzephyr,console = &uart0;\n\t\tzephyr,flash = &flash0;\n\t}};\n\
         \tflash0: flash@0 {{\n\t\tcompatible = \"soc-nv-flash\";\n\t\treg = <0x0 {:#x}>;\n\t}};\n}};\n",
        size
    )
}

/// Scratch tree with the directories a run touches.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for sub in ["artifacts", "zephyr", "work", "snapshots", "configs"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    /// Configuration rooted in this workspace with `sh -c <script>` as the
    /// simulator.
    pub fn config(&self, simulator_script: &str) -> RunConfig {
        RunConfig {
            artifacts_dir: self.path("artifacts"),
            zephyr_path: self.path("zephyr"),
            sim_work_dir: self.path("work"),
            snapshots_dir: self.path("snapshots"),
            configs_dir: self.path("configs"),
            simulator: CommandSpec::new("sh", &["-c", simulator_script, "simulator"]),
            log_grace_ms: 0,
            ..RunConfig::default()
        }
    }
}

/// Canned translator output.
pub struct MockTranslator {
    pub chain: Vec<String>,
    pub console: Option<String>,
    pub topology: String,
    pub fail_topology: bool,
    pub overlays_seen: Mutex<Vec<String>>,
}

impl MockTranslator {
    pub fn cortex_m(console: Option<&str>) -> Self {
        Self {
            chain: vec!["!cortex-m4f".to_string(), "nrf52832".to_string(), "cortex-m4".to_string()],
            console: console.map(str::to_string),
            topology: "cpu0: CPU.CortexM @ sysbus\n    cpuType: \"cortex-m4\"\n".to_string(),
            fail_topology: false,
            overlays_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn cpu_chain(&self, _arch: &str, _hw_desc: &Path) -> Result<Vec<String>> {
        Ok(self.chain.clone())
    }

    async fn console_device(&self, _hw_desc: &Path) -> Result<Option<String>> {
        Ok(self.console.clone())
    }

    async fn machine_topology(&self, _hw_desc: &Path, overlays: &str) -> Result<String> {
        self.overlays_seen.lock().push(overlays.to_string());
        if self.fail_topology {
            return Err(anyhow!("unsupported devicetree"));
        }
        Ok(self.topology.clone())
    }
}

/// One planned invocation of [`MockBuildTool`].
#[derive(Clone)]
pub struct PlannedBuild {
    pub success: bool,
    pub log: String,
    /// Hardware description written next to the binary, if any.
    pub dts: Option<String>,
}

impl PlannedBuild {
    pub fn ok(log: &str, dts: Option<String>) -> Self {
        Self {
            success: true,
            log: log.to_string(),
            dts,
        }
    }

    pub fn failed(log: &str, dts: Option<String>) -> Self {
        Self {
            success: false,
            log: log.to_string(),
            dts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub extra_args: Vec<String>,
    /// Contents of the `-DDTC_OVERLAY_FILE` overlay at build time.
    pub overlay: Option<String>,
}

/// Build tool that writes artifacts the way the build script does, following
/// a fixed plan.
pub struct MockBuildTool {
    artifacts_dir: PathBuf,
    plan: Mutex<Vec<PlannedBuild>>,
    pub calls: Mutex<Vec<RecordedBuild>>,
}

impl MockBuildTool {
    pub fn new(artifacts_dir: &Path, plan: Vec<PlannedBuild>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.to_path_buf(),
            plan: Mutex::new(plan),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl BuildTool for MockBuildTool {
    async fn build(&self, target: &BuildTarget, extra_args: &[String]) -> BuildAttempt {
        let overlay = extra_args
            .iter()
            .find_map(|arg| arg.strip_prefix("-DDTC_OVERLAY_FILE="))
            .and_then(|path| std::fs::read_to_string(path).ok());
        self.calls.lock().push(RecordedBuild {
            extra_args: extra_args.to_vec(),
            overlay,
        });

        let planned = {
            let mut plan = self.plan.lock();
            if plan.is_empty() {
                panic!("unexpected build of {}", target.board_id);
            }
            plan.remove(0)
        };

        let paths = ArtifactPaths::new(&self.artifacts_dir, &target.board_id, target.sample);
        std::fs::create_dir_all(paths.dir()).unwrap();
        if let Some(dts) = &planned.dts {
            std::fs::write(paths.path(ArtifactKind::Dts), dts).unwrap();
        }
        std::fs::write(paths.path(ArtifactKind::ZephyrLog), &planned.log).unwrap();
        if planned.success {
            std::fs::write(paths.path(ArtifactKind::Elf), b"\x7fELF").unwrap();
            std::fs::write(
                paths.path(ArtifactKind::Config),
                format!("CONFIG_BOARD=\"{}\"\nCONFIG_SERIAL=y\n", target.board_id),
            )
            .unwrap();
        }

        BuildAttempt {
            success: planned.success,
            exit_code: Some(if planned.success { 0 } else { 1 }),
            log: planned.log,
            duration_ms: 1,
        }
    }
}

/// In-memory artifact store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fetched: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.lock().insert(key.into(), bytes.into());
    }

    /// Publish the local copy of `kind` under its store key.
    pub fn publish(&self, paths: &ArtifactPaths, kind: ArtifactKind) {
        let bytes = std::fs::read(paths.path(kind)).unwrap();
        self.insert(paths.remote_key(kind), bytes);
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.fetched.lock().push(key.to_string());
        Ok(self.objects.lock().get(key).cloned())
    }
}
