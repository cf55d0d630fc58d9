use std::path::PathBuf;

use thiserror::Error;

/// Run-level failures. Per-query problems (engine errors, stalls) are not
/// errors; they surface as [`crate::harness::QueryOutcome`] values.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read query corpus {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine initialization failed: {0}")]
    Initialization(String),

    #[error("engine exited unexpectedly (status: {status})")]
    ProcessExit { status: String },

    #[error("unrecoverable error reading engine {channel}: {message}")]
    Stream { channel: String, message: String },

    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint file {} has unexpected header: {found}", path.display())]
    SinkSchema { path: PathBuf, found: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Process exit code the `cardlab` binary uses for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Parse { .. } => 2,
            HarnessError::Initialization(_) => 3,
            HarnessError::ProcessExit { .. } => 4,
            HarnessError::Stream { .. } => 5,
            _ => 1,
        }
    }

    /// Stable machine-readable code for `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::Parse { .. } => "corpus_parse_error",
            HarnessError::Initialization(_) => "initialization_error",
            HarnessError::ProcessExit { .. } => "process_exit",
            HarnessError::Stream { .. } => "stream_error",
            HarnessError::Spawn { .. } => "spawn_error",
            HarnessError::SinkSchema { .. } => "sink_schema_mismatch",
            HarnessError::Config(_) => "config_error",
            HarnessError::Csv(_) => "csv_error",
            HarnessError::Json(_) => "json_error",
            HarnessError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
