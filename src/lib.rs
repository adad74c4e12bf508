pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod core;
pub mod detection;
pub mod environment;
pub mod error;
pub mod execution;
pub mod intelligent_build;
pub mod jobs;
pub mod pipeline;
pub mod remote;
pub mod render;
pub mod reuse;
pub mod simulation;

use async_trait::async_trait;
use crate::config::CommandSpec;
use crate::core::BuildTarget;
use crate::execution::BuildAttempt;

/// Produces firmware for one target. Failures are reported in the attempt,
/// never as errors.
#[async_trait]
pub trait BuildTool: Send + Sync {
    async fn build(&self, target: &BuildTarget, extra_args: &[String]) -> BuildAttempt;
}

/// Build tool that shells out to the board build script.
pub struct ScriptBuildTool {
    script: CommandSpec,
}

impl ScriptBuildTool {
    pub fn new(script: CommandSpec) -> Self {
        Self { script }
    }
}

#[async_trait]
impl BuildTool for ScriptBuildTool {
    async fn build(&self, target: &BuildTarget, extra_args: &[String]) -> BuildAttempt {
        execution::run_build_script(&self.script, target, extra_args).await
    }
}
