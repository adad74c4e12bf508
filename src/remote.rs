use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::core::{ArtifactKind, ArtifactPaths, ResultStatus, Sample};
use crate::error::RunError;

/// Content store holding artifacts from earlier runs. A missing object is
/// `Ok(None)`; only transport failures are errors.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Previously published result for one board, as listed in the remote index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub board_name: String,
    pub sample_name: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub files: Vec<String>,
}

impl RemoteResult {
    pub fn passed(&self) -> bool {
        self.status == ResultStatus::Passed
    }

    pub fn has_file(&self, kind: ArtifactKind) -> bool {
        self.files.iter().any(|f| f == kind.as_str())
    }

    /// Listed artifact kinds this crate knows about.
    pub fn kinds(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.has_file(*kind))
            .collect()
    }
}

/// Read-only snapshot of the remote results, keyed by board name.
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    boards: HashMap<String, RemoteResult>,
}

impl RemoteIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_results(results: Vec<RemoteResult>) -> Self {
        let mut boards = HashMap::new();
        for result in results {
            // First entry wins, like a linear search over the published list.
            boards.entry(result.board_name.clone()).or_insert(result);
        }
        Self { boards }
    }

    pub fn get(&self, board: &str) -> Option<&RemoteResult> {
        self.boards.get(board)
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Fetch `results-{sample}_all.json`. A missing index is an empty one.
    pub async fn fetch(store: &dyn ArtifactStore, sample: Sample) -> Result<Self> {
        let key = format!("results-{}_all.json", sample.name());
        match store.fetch(&key).await? {
            Some(bytes) => {
                let results: Vec<RemoteResult> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse remote index {}", key))?;
                Ok(Self::from_results(results))
            }
            None => {
                tracing::warn!("Remote index {} not found, every board will be simulated", key);
                Ok(Self::empty())
            }
        }
    }
}

/// `{name}.version` published next to the results, trimmed.
pub async fn fetch_remote_version(store: &dyn ArtifactStore, name: &str) -> Result<Option<String>> {
    let key = format!("{}.version", name);
    Ok(store
        .fetch(&key)
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()))
}

/// Download `kinds` for one target, writing each to its local path plus
/// `suffix`. Stops at the first missing artifact and returns whether all of
/// them were found.
pub async fn download_artifacts(
    store: &dyn ArtifactStore,
    paths: &ArtifactPaths,
    kinds: &[ArtifactKind],
    suffix: &str,
) -> Result<bool> {
    let mut report = Vec::new();
    let mut complete = true;

    for kind in kinds {
        match store.fetch(&paths.remote_key(*kind)).await? {
            Some(bytes) => {
                let dest = paths.with_suffix(*kind, suffix);
                fs::write(&dest, bytes)
                    .await
                    .with_context(|| format!("Failed to write {:?}", dest))?;
                report.push(format!("{} found", kind));
            }
            None => {
                report.push(format!("{} not found", kind));
                complete = false;
                break;
            }
        }
    }

    tracing::info!(
        "Downloading artifacts {}, sample: {}, files: {}.",
        paths.board(),
        paths.sample(),
        report.join(", ")
    );
    Ok(complete)
}

/// Store reached over HTTP at `{base_url}/{key}`.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", concat!("firmware-sim-runner/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|source| RunError::Fetch {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            tracing::debug!("{} -> HTTP {}", url, response.status());
            return Ok(None);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| RunError::Fetch { url, source })?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Store backed by a local directory tree, for offline runs and mirrors.
pub struct DirectoryArtifactStore {
    root: std::path::PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from {:?}", key, self.root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_segments_are_encoded() {
        let store = HttpArtifactStore::new("https://dash.example.org/");
        assert_eq!(
            store.url_for("a b-hello_world/a b-hello_world.repl"),
            "https://dash.example.org/a%20b-hello_world/a%20b-hello_world.repl"
        );
    }

    #[test]
    fn index_keeps_first_entry_per_board() {
        let entry = |status| RemoteResult {
            board_name: "b".into(),
            sample_name: "hello_world".into(),
            status,
            files: vec!["elf".into(), "repl".into(), "not-a-kind".into()],
        };
        let index = RemoteIndex::from_results(vec![entry(ResultStatus::Passed), entry(ResultStatus::Built)]);
        assert_eq!(index.len(), 1);
        let b = index.get("b").unwrap();
        assert!(b.passed());
        assert_eq!(b.kinds(), vec![ArtifactKind::Elf, ArtifactKind::Repl]);
    }
}
