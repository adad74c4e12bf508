use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

use crate::core::{ArtifactKind, ArtifactPaths, BuildOutcome, BuildTarget, MemoryRegion};
use crate::detection::HardwareDescriptionAnalyzer;
use crate::execution::{toolchain_env, BuildAttempt};
use crate::render;
use crate::BuildTool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStrategy {
    /// Rebuild with the flash region replaced by the given, larger one.
    FlashOverlay(MemoryRegion),
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub attempts: Vec<BuildAttempt>,
    /// Region passed to the retry, when one happened.
    pub enlarged_region: Option<MemoryRegion>,
}

impl BuildReport {
    pub fn not_built() -> Self {
        Self {
            outcome: BuildOutcome::NotBuilt,
            attempts: Vec::new(),
            enlarged_region: None,
        }
    }

    pub fn retried(&self) -> bool {
        self.attempts.len() > 1
    }

    pub fn last_log(&self) -> &str {
        self.attempts.last().map(|a| a.log.as_str()).unwrap_or("")
    }
}

/// Overflow rounded up to whole KiB and added to the original size. `None`
/// when the result does not fit the address space.
pub fn enlarged_flash_size(original_size: u64, overflow_bytes: u64) -> Option<u64> {
    overflow_bytes
        .div_ceil(1024)
        .checked_mul(1024)
        .and_then(|increase| original_size.checked_add(increase))
}

/// Classification of a single attempt.
pub fn classify(attempt: &BuildAttempt) -> BuildOutcome {
    if attempt.success {
        BuildOutcome::Built
    } else if attempt.flash_overflow().is_some() {
        BuildOutcome::FailedOverflow
    } else {
        BuildOutcome::FailedOther
    }
}

/// Builds a target and retries once with an enlarged flash region when the
/// link fails on flash overflow.
pub struct IntelligentBuilder {
    tool: Arc<dyn BuildTool>,
    analyzer: Arc<HardwareDescriptionAnalyzer>,
}

impl IntelligentBuilder {
    pub fn new(tool: Arc<dyn BuildTool>, analyzer: Arc<HardwareDescriptionAnalyzer>) -> Self {
        Self { tool, analyzer }
    }

    pub async fn execute_with_fallbacks(
        &self,
        target: &BuildTarget,
        paths: &ArtifactPaths,
    ) -> Result<BuildReport> {
        if toolchain_env(&target.toolchain).is_none() {
            tracing::warn!("Toolchain {} not found!", target.toolchain);
            return Ok(BuildReport::not_built());
        }

        // A backup left by an earlier run would skew the reported flash size.
        remove_if_exists(&paths.dts_backup()).await?;

        let mut report = BuildReport::not_built();
        let first = self.tool.build(target, &target.extra_build_args).await;
        let first_outcome = classify(&first);
        let log = first.log.clone();
        report.attempts.push(first);

        report.outcome = match first_outcome {
            BuildOutcome::Built => BuildOutcome::Built,
            BuildOutcome::FailedOverflow => {
                match self.analyze_error(&log, &paths.path(ArtifactKind::Dts)).await {
                    Some(BuildStrategy::FlashOverlay(region)) => {
                        let retry = self.retry_with_overlay(target, paths, &region).await?;
                        report.enlarged_region = Some(region);
                        let outcome = if retry.success {
                            BuildOutcome::Built
                        } else {
                            BuildOutcome::FailedOther
                        };
                        report.attempts.push(retry);
                        outcome
                    }
                    _ => {
                        tracing::info!(
                            "Flash overflow on {} but the flash region cannot be resized",
                            target.board_id
                        );
                        BuildOutcome::FailedOther
                    }
                }
            }
            other => other,
        };

        Ok(report)
    }

    /// Strategy for a failed build log, based on the hardware description
    /// produced by that build.
    pub async fn analyze_error(&self, log: &str, dts: &Path) -> Option<BuildStrategy> {
        let overflow = crate::execution::flash_overflow_bytes(log)?;
        let mut region = self.analyzer.flash_region(dts).await?;
        region.size_bytes = enlarged_flash_size(region.size_bytes, overflow)?;
        tracing::info!(
            "Flash overflowed by {} bytes, retrying with {} size {:#x}",
            overflow,
            region.name,
            region.size_bytes
        );
        Some(BuildStrategy::FlashOverlay(region))
    }

    async fn retry_with_overlay(
        &self,
        target: &BuildTarget,
        paths: &ArtifactPaths,
        region: &MemoryRegion,
    ) -> Result<BuildAttempt> {
        let dts = paths.path(ArtifactKind::Dts);
        fs::copy(&dts, paths.dts_backup())
            .await
            .with_context(|| format!("Failed to back up {:?}", dts))?;

        let mut overlay = tempfile::Builder::new()
            .prefix("flash_override")
            .suffix(".overlay")
            .tempfile()
            .context("Failed to create flash overlay")?;
        overlay.write_all(render::flash_overlay(region).as_bytes())?;
        overlay.flush()?;

        let mut args = target.extra_build_args.clone();
        args.push(format!("-DDTC_OVERLAY_FILE={}", overlay.path().display()));

        // The overlay file lives until the retry returns.
        Ok(self.tool.build(target, &args).await)
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}
