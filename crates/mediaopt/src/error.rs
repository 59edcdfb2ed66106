use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::job::CancelReason;

/// Everything that can end a job without a published output
#[derive(Debug, Error)]
pub enum JobError {
    /// Input missing or the working directory unusable; nothing was probed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Duration could not be determined, so no job starts
    #[error("probe failed for {path}: {detail}")]
    Probe { path: PathBuf, detail: String },

    #[error("no audio stream found in {0}")]
    NoAudioStream(PathBuf),

    #[error("failed to launch engine {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Engine exited non-zero; `stderr` holds the tail of its diagnostic output
    #[error("engine exited with code {}\n{stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    EngineExit { code: Option<i32>, stderr: String },

    #[error("no progress for {}s, job stalled", idle.as_secs())]
    Stalled { idle: Duration },

    #[error("failed to publish {from} -> {to}: {source}")]
    Commit {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        JobError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn probe(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        JobError::Probe {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
