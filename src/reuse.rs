use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::fs;

use crate::core::{ArtifactKind, ArtifactPaths};
use crate::remote::{download_artifacts, ArtifactStore, RemoteIndex};

/// Generated inputs that fully determine a simulation run: build config,
/// machine description, control script (which carries the console device)
/// and test script.
pub const COMPARED_ARTIFACTS: [ArtifactKind; 4] = [
    ArtifactKind::Config,
    ArtifactKind::Repl,
    ArtifactKind::Resc,
    ArtifactKind::Robot,
];

pub const SHADOW_SUFFIX: &str = ".remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MustSimulateReason {
    NoRemoteResult,
    MissingRemoteArtifact,
    Changed(ArtifactKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseDecision {
    MustSimulate(MustSimulateReason),
    ReuseRemote { remote_passed: bool },
}

pub struct RemoteReuseDecider {
    store: Arc<dyn ArtifactStore>,
}

impl RemoteReuseDecider {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Decide whether the published result for this board can stand in for a
    /// fresh simulation. Expects the local copies of [`COMPARED_ARTIFACTS`] to
    /// have been regenerated already.
    pub async fn decide(&self, paths: &ArtifactPaths, index: &RemoteIndex) -> Result<ReuseDecision> {
        let Some(remote) = index.get(paths.board()) else {
            return Ok(ReuseDecision::MustSimulate(MustSimulateReason::NoRemoteResult));
        };

        let complete =
            download_artifacts(self.store.as_ref(), paths, &COMPARED_ARTIFACTS, SHADOW_SUFFIX).await;
        let verdict = match complete {
            Ok(true) => self.compare_shadows(paths).await,
            Ok(false) => Ok(Some(MustSimulateReason::MissingRemoteArtifact)),
            Err(e) => Err(e),
        };
        self.remove_shadows(paths).await?;

        if let Some(reason) = verdict? {
            return Ok(ReuseDecision::MustSimulate(reason));
        }

        let kinds: Vec<ArtifactKind> = remote
            .kinds()
            .into_iter()
            .filter(|kind| !matches!(kind, ArtifactKind::Elf | ArtifactKind::Dts))
            .collect();
        if !download_artifacts(self.store.as_ref(), paths, &kinds, "").await? {
            tracing::warn!(
                "Some published artifacts of {} are missing, keeping local copies",
                paths.board()
            );
        }
        tracing::info!("Skipping simulation for platform {}!", paths.board());

        Ok(ReuseDecision::ReuseRemote {
            remote_passed: remote.passed(),
        })
    }

    async fn compare_shadows(&self, paths: &ArtifactPaths) -> Result<Option<MustSimulateReason>> {
        for kind in COMPARED_ARTIFACTS {
            let local = paths.path(kind);
            let remote = fs::read(paths.with_suffix(kind, SHADOW_SUFFIX))
                .await
                .with_context(|| format!("Failed to read downloaded {}", kind))?;
            let same = match fs::read(&local).await {
                Ok(bytes) => bytes == remote,
                Err(_) => false,
            };
            if !same {
                tracing::info!("Found difference in {:?} contents!", local);
                return Ok(Some(MustSimulateReason::Changed(kind)));
            }
        }
        Ok(None)
    }

    async fn remove_shadows(&self, paths: &ArtifactPaths) -> Result<()> {
        for kind in COMPARED_ARTIFACTS {
            let shadow = paths.with_suffix(kind, SHADOW_SUFFIX);
            match fs::remove_file(&shadow).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {:?}", shadow)),
            }
        }
        Ok(())
    }
}
