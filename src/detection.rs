use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;

use crate::config::CommandSpec;
use crate::core::{CpuDependencyChain, MemoryRegion};
use crate::error::RunError;

/// Turns a hardware description (devicetree) into simulator inputs.
#[async_trait]
pub trait Translator: Send + Sync {
    /// CPU model aliases, most specific first.
    async fn cpu_chain(&self, arch: &str, hw_desc: &Path) -> Result<Vec<String>>;
    /// Peripheral used as the interactive console, if any.
    async fn console_device(&self, hw_desc: &Path) -> Result<Option<String>>;
    /// Simulator machine description for `hw_desc` with the given overlays.
    async fn machine_topology(&self, hw_desc: &Path, overlays: &str) -> Result<String>;
}

/// Locate the memory range referenced by `region_alias` (e.g. `zephyr,flash`).
///
/// Looks for `<region_alias> = &<label>;` and then for the `reg = <...>;`
/// property following `<label>:`. The last two register cells are read as hex
/// base and size. Returns `None` when either declaration is missing or the
/// cells do not parse.
pub fn find_memory_region(hw_desc: &str, region_alias: &str) -> Option<MemoryRegion> {
    let reference = Regex::new(&format!(r"{}\s*=\s*&(\w+)\s*;", regex::escape(region_alias))).ok()?;
    let label = reference.captures(hw_desc)?.get(1)?.as_str();

    let declaration = Regex::new(&format!(
        r"\b{}:(?:.*\n)*?.*reg\s*=\s*<([^>]*)>\s*;",
        regex::escape(label)
    ))
    .ok()?;
    let cells: Vec<&str> = declaration
        .captures(hw_desc)?
        .get(1)?
        .as_str()
        .split_whitespace()
        .collect();

    if cells.len() < 2 {
        return None;
    }
    let base_address = parse_hex_cell(cells[cells.len() - 2])?;
    let size_bytes = parse_hex_cell(cells[cells.len() - 1])?;

    Some(MemoryRegion {
        name: label.to_string(),
        base_address,
        size_bytes,
    })
}

fn parse_hex_cell(cell: &str) -> Option<u64> {
    let digits = cell
        .strip_prefix("0x")
        .or_else(|| cell.strip_prefix("0X"))
        .unwrap_or(cell);
    u64::from_str_radix(digits, 16).ok()
}

/// First non-negated CPU in the chain, or an empty string.
pub fn select_primary_cpu(chain: &CpuDependencyChain) -> String {
    chain.primary().to_string()
}

pub struct HardwareDescriptionAnalyzer {
    translator: Arc<dyn Translator>,
    flash_alias: String,
}

impl HardwareDescriptionAnalyzer {
    pub fn new(translator: Arc<dyn Translator>, flash_alias: impl Into<String>) -> Self {
        Self {
            translator,
            flash_alias: flash_alias.into(),
        }
    }

    /// Flash region declared in the hardware description file at `path`.
    pub async fn flash_region(&self, path: &Path) -> Option<MemoryRegion> {
        match fs::read_to_string(path).await {
            Ok(text) => find_memory_region(&text, &self.flash_alias),
            Err(e) => {
                tracing::debug!("Cannot read hardware description {:?}: {}", path, e);
                None
            }
        }
    }

    /// CPU chain from the translator; empty when the translator fails on this
    /// description. Environment faults still propagate.
    pub async fn derive_cpu_chain(&self, arch: &str, hw_desc: &Path) -> Result<CpuDependencyChain> {
        match self.translator.cpu_chain(arch, hw_desc).await {
            Ok(chain) => Ok(CpuDependencyChain(chain)),
            Err(e) if e.downcast_ref::<RunError>().is_some() => Err(e),
            Err(e) => {
                tracing::warn!("No CPU information for {:?}: {}", hw_desc, e);
                Ok(CpuDependencyChain::default())
            }
        }
    }

    pub async fn derive_console_device(&self, hw_desc: &Path) -> Result<Option<String>> {
        match self.translator.console_device(hw_desc).await {
            Ok(device) => Ok(device.filter(|d| !d.is_empty())),
            Err(e) if e.downcast_ref::<RunError>().is_some() => Err(e),
            Err(e) => {
                tracing::warn!("No console device for {:?}: {}", hw_desc, e);
                Ok(None)
            }
        }
    }
}

const CPU_CHAIN_SCRIPT: &str = "\
import json, sys
from dts2repl import dts2repl
print(json.dumps(dts2repl.get_cpu_dep_chain(sys.argv[1], sys.argv[2], sys.argv[3], [])))
";

const CONSOLE_SCRIPT: &str = "\
import json, sys
from dts2repl import dts2repl
print(json.dumps(dts2repl.get_uart(sys.argv[1])))
";

const TOPOLOGY_SCRIPT: &str = "\
import sys
from argparse import Namespace
from dts2repl import dts2repl
sys.stdout.write(dts2repl.generate(Namespace(filename=sys.argv[1], overlays=sys.argv[2])))
";

/// Translator backed by the `dts2repl` Python package.
pub struct Dts2ReplTranslator {
    interpreter: CommandSpec,
    zephyr_path: PathBuf,
}

impl Dts2ReplTranslator {
    pub fn new(interpreter: CommandSpec, zephyr_path: PathBuf) -> Self {
        Self {
            interpreter,
            zephyr_path,
        }
    }

    async fn run_script(&self, script: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.interpreter.program)
            .args(&self.interpreter.args)
            .arg("-c")
            .arg(script)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RunError::Spawn {
                program: self.interpreter.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(anyhow!(
                "dts2repl failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Translator for Dts2ReplTranslator {
    async fn cpu_chain(&self, arch: &str, hw_desc: &Path) -> Result<Vec<String>> {
        let hw_desc = hw_desc.to_string_lossy();
        let zephyr = self.zephyr_path.to_string_lossy();
        let out = self
            .run_script(CPU_CHAIN_SCRIPT, &[arch, &hw_desc, &zephyr])
            .await?;
        Ok(serde_json::from_str(out.trim())?)
    }

    async fn console_device(&self, hw_desc: &Path) -> Result<Option<String>> {
        let out = self
            .run_script(CONSOLE_SCRIPT, &[&hw_desc.to_string_lossy()])
            .await?;
        Ok(serde_json::from_str(out.trim())?)
    }

    async fn machine_topology(&self, hw_desc: &Path, overlays: &str) -> Result<String> {
        self.run_script(TOPOLOGY_SCRIPT, &[&hw_desc.to_string_lossy(), overlays])
            .await
    }
}
