use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::Toolchain;

const OMIT_ARCHES: [&str; 2] = ["arc", "posix"];
const OMIT_BOARDS: [&str; 6] = ["acrn", "qemu", "native", "nsim", "xenvm", "xt-sim"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub name: String,
    pub arch: String,
    /// Board directory relative to the Zephyr tree, e.g. `boards/arm/nrf52dk`.
    pub path: String,
}

impl BoardInfo {
    pub fn dir(&self, zephyr_path: &Path) -> PathBuf {
        zephyr_path.join(&self.path)
    }

    /// Board-level devicetree source, used for CPU detection.
    pub fn dts_path(&self, zephyr_path: &Path) -> PathBuf {
        self.dir(zephyr_path).join(format!("{}.dts", self.name))
    }

    /// Board metadata file; some boards use a hyphenated file name.
    pub fn yaml_path(&self, zephyr_path: &Path) -> PathBuf {
        let yaml = self.dir(zephyr_path).join(format!("{}.yaml", self.name));
        if yaml.exists() {
            yaml
        } else {
            self.dir(zephyr_path)
                .join(format!("{}.yaml", self.name.replace('_', "-")))
        }
    }
}

#[derive(Debug, Deserialize)]
struct BoardYaml {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    toolchain: Vec<String>,
}

fn read_board_yaml(path: &Path) -> Option<BoardYaml> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&content) {
        Ok(yaml) => Some(yaml),
        Err(e) => {
            tracing::warn!("Could not parse board YAML {:?}: {}", path, e);
            None
        }
    }
}

/// Human readable board name. Long names lose their parenthesised parts.
pub fn board_full_name(yaml_path: &Path) -> String {
    let Some(name) = read_board_yaml(yaml_path).and_then(|yaml| yaml.name) else {
        return String::new();
    };
    if name.chars().count() > 50 {
        match Regex::new(r"\(.*\)") {
            Ok(parens) => parens.replace_all(&name, "").into_owned(),
            Err(_) => name,
        }
    } else {
        name
    }
}

/// Toolchain for a board: `zephyr` when listed, otherwise the first entry.
pub fn board_toolchain(yaml_path: &Path) -> Toolchain {
    match read_board_yaml(yaml_path) {
        Some(yaml) => {
            if yaml.toolchain.iter().any(|t| t == "zephyr") {
                Toolchain::Zephyr
            } else {
                yaml.toolchain
                    .first()
                    .map(|t| Toolchain::parse(t))
                    .unwrap_or(Toolchain::Zephyr)
            }
        }
        None => {
            tracing::warn!(
                "Could not open YAML file {:?}! Defaulting to Zephyr toolchain...",
                yaml_path
            );
            Toolchain::Zephyr
        }
    }
}

/// Read-only list of boards known to the run.
#[derive(Debug, Clone, Default)]
pub struct BoardCatalog {
    boards: BTreeMap<String, BoardInfo>,
}

impl BoardCatalog {
    pub fn new(boards: Vec<BoardInfo>) -> Self {
        Self {
            boards: boards.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read board catalog {:?}", path))?;
        let boards: Vec<BoardInfo> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse board catalog {:?}", path))?;
        Ok(Self::new(boards))
    }

    pub fn get(&self, name: &str) -> Option<&BoardInfo> {
        self.boards.get(name)
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Boards included in an "all boards" run.
    pub fn runnable(&self) -> Vec<&BoardInfo> {
        self.boards
            .values()
            .filter(|b| !b.name.starts_with("fvp_"))
            .filter(|b| !OMIT_ARCHES.contains(&b.arch.as_str()))
            .filter(|b| !OMIT_BOARDS.iter().any(|omit| b.name.contains(omit)))
            .collect()
    }
}
