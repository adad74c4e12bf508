use std::path::PathBuf;
use thiserror::Error;

/// Faults in the surrounding environment. Any of these aborts the whole run;
/// everything else a target can run into is reported as data.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("required tool `{0}` not found")]
    ToolMissing(String),

    #[error("zephyr tree not found at {0}")]
    ZephyrNotFound(PathBuf),

    #[error("remote fetch of {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown sample `{0}`")]
    UnknownSample(String),

    #[error("platform `{0}` not found in the board catalog")]
    UnknownBoard(String),
}
