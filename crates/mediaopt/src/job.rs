use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{EncodingParams, TranscodeConfig};
use crate::error::JobError;

/// Receives strictly increasing completion percentages for one job
pub type ProgressSink = mpsc::UnboundedSender<f64>;

/// Container extensions the temp output may keep; anything else becomes mkv
const TEMP_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi"];

/// Canonical input path; at most one active job exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(PathBuf);

impl JobKey {
    /// Canonicalize `input`, failing if it does not exist
    pub fn for_input(input: &Path) -> Result<Self, JobError> {
        std::fs::canonicalize(input)
            .map(JobKey)
            .map_err(|e| JobError::InvalidInput(format!("{}: {}", input.display(), e)))
    }

    /// Async form of [`JobKey::for_input`] for use on the runtime
    pub async fn resolve(input: &Path) -> Result<Self, JobError> {
        tokio::fs::canonicalize(input)
            .await
            .map(JobKey)
            .map_err(|e| JobError::InvalidInput(format!("{}: {}", input.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Job lifecycle; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Probing,
    Selecting,
    Running,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Why a job was terminated before it could commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Explicit `cancel(input)` request
    Requested,
    /// A newer job was submitted for the same key
    Superseded,
    /// No forward progress for `idle`
    Stalled { idle: Duration },
    /// The job exceeded the configured runtime limit
    TimedOut { limit: Duration },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancel requested"),
            CancelReason::Superseded => write!(f, "superseded by a newer job"),
            CancelReason::Stalled { idle } => write!(f, "stalled for {}s", idle.as_secs()),
            CancelReason::TimedOut { limit } => write!(f, "exceeded {}s runtime limit", limit.as_secs()),
        }
    }
}

/// Terminal outcome of a job
#[derive(Debug)]
pub enum JobResult {
    Success { output: PathBuf },
    Failed(JobError),
    Cancelled(CancelReason),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }

    pub fn state(&self) -> JobState {
        match self {
            JobResult::Success { .. } => JobState::Completed,
            JobResult::Failed(_) => JobState::Failed,
            JobResult::Cancelled(_) => JobState::Cancelled,
        }
    }

    /// Flatten into a `Result`; a stall cancellation surfaces as `JobError::Stalled`
    pub fn into_result(self) -> Result<PathBuf, JobError> {
        match self {
            JobResult::Success { output } => Ok(output),
            JobResult::Failed(e) => Err(e),
            JobResult::Cancelled(CancelReason::Stalled { idle }) => Err(JobError::Stalled { idle }),
            JobResult::Cancelled(reason) => Err(JobError::Cancelled(reason)),
        }
    }
}

/// A caller's request to transcode one file
#[derive(Debug)]
pub struct JobRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub(crate) progress: Option<ProgressSink>,
}

impl JobRequest {
    /// Request with the default `<stem>_optimized.<ext>` output next to the input
    pub fn new(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        let output = default_output_path(&input);
        Self {
            input,
            output,
            progress: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    /// Deliver progress samples to `sink`
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// `movie.mkv` -> `movie_optimized.mkv`
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_optimized.{}", stem, ext),
        None => format!("{}_optimized", stem),
    };
    input.with_file_name(name)
}

/// Container extension used for the temp output of `output`
pub fn temp_extension(output: &Path) -> String {
    output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .filter(|e| TEMP_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or_else(|| "mkv".to_string())
}

/// Audio handling resolved by the stream selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioChoice {
    /// Keep the stream with this absolute index
    Stream(i32),
    /// Drop audio entirely
    None,
}

/// Everything needed to run one engine invocation; immutable once built
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Uuid,
    pub key: JobKey,
    pub input: PathBuf,
    pub output: PathBuf,
    pub temp_dir: PathBuf,
    pub temp_output: PathBuf,
    pub progress_path: PathBuf,
    pub audio: AudioChoice,
    pub threads: usize,
    pub duration_secs: f64,
    pub encoding: EncodingParams,
}

impl JobSpec {
    pub fn new(
        cfg: &TranscodeConfig,
        id: Uuid,
        key: JobKey,
        output: PathBuf,
        audio: AudioChoice,
        duration_secs: f64,
        input_bytes: u64,
    ) -> Self {
        let temp_output = cfg
            .temp_dir
            .join(format!("temp_{}.{}", id.simple(), temp_extension(&output)));
        let progress_path = cfg.temp_dir.join(format!("progress_{}.txt", id.simple()));

        JobSpec {
            id,
            input: key.path().to_path_buf(),
            key,
            output,
            temp_dir: cfg.temp_dir.clone(),
            temp_output,
            progress_path,
            audio,
            threads: cfg.thread_count(input_bytes),
            duration_secs,
            encoding: cfg.encoding.clone(),
        }
    }
}
