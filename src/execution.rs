use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::process::Command;

use crate::config::CommandSpec;
use crate::core::{BuildTarget, Toolchain};

/// Raw result of one build-tool invocation. Failures of any kind end up in
/// `log`; callers classify by inspecting the text.
#[derive(Debug, Clone)]
pub struct BuildAttempt {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub log: String,
    pub duration_ms: u64,
}

impl BuildAttempt {
    pub fn failed(log: impl Into<String>, start_time: Instant) -> Self {
        Self {
            success: false,
            exit_code: None,
            log: log.into(),
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    /// Bytes reported by ``region `FLASH' overflowed by N bytes``, if present.
    pub fn flash_overflow(&self) -> Option<u64> {
        if self.success {
            return None;
        }
        flash_overflow_bytes(&self.log)
    }
}

fn overflow_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"region `FLASH' overflowed by (\d+) bytes").expect("valid overflow pattern")
    })
}

pub fn flash_overflow_bytes(log: &str) -> Option<u64> {
    overflow_pattern()
        .captures(log)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extra environment for a toolchain, `None` when the toolchain is unknown.
pub fn toolchain_env(toolchain: &Toolchain) -> Option<Vec<(String, String)>> {
    match toolchain {
        Toolchain::Zephyr => Some(Vec::new()),
        Toolchain::Espressif => {
            let home = std::env::var("HOME").unwrap_or_default();
            let tools = PathBuf::from(home)
                .join(".espressif")
                .join("tools")
                .join("zephyr");
            Some(vec![
                ("ZEPHYR_TOOLCHAIN_VARIANT".to_string(), "espressif".to_string()),
                (
                    "ESPRESSIF_TOOLCHAIN_PATH".to_string(),
                    tools.to_string_lossy().into_owned(),
                ),
            ])
        }
        Toolchain::Other(_) => None,
    }
}

/// Argument string forwarded to the underlying CMake invocation.
pub fn forwarded_args(extra_args: &[String]) -> String {
    let joined = extra_args
        .iter()
        .filter(|a| !a.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        String::new()
    } else {
        format!("-- {}", joined)
    }
}

/// Run the build script as `<script> <board> <sample path> <args> <sample>`.
pub async fn run_build_script(
    script: &CommandSpec,
    target: &BuildTarget,
    extra_args: &[String],
) -> BuildAttempt {
    let start_time = Instant::now();

    let Some(env) = toolchain_env(&target.toolchain) else {
        return BuildAttempt::failed(
            format!("Toolchain {} not found!", target.toolchain),
            start_time,
        );
    };

    tracing::info!(
        "Building for {}, sample: {} with args: {:?} using {} toolchain.",
        target.board_id,
        target.sample,
        extra_args,
        target.toolchain
    );

    let output = Command::new(&script.program)
        .args(&script.args)
        .arg(&target.board_id)
        .arg(&target.sample_source_path)
        .arg(forwarded_args(extra_args))
        .arg(target.sample.name())
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match output {
        Ok(output) => {
            let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            BuildAttempt {
                success: output.status.success(),
                exit_code: output.status.code(),
                log,
                duration_ms: start_time.elapsed().as_millis() as u64,
            }
        }
        Err(e) => {
            tracing::warn!("Build script {} could not be started: {}", script.program, e);
            BuildAttempt::failed(
                format!("failed to run {}: {}", script.program, e),
                start_time,
            )
        }
    }
}
