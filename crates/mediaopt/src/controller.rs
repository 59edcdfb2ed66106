use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commit::TempArtifacts;
use crate::config::{MissingAudioPolicy, TranscodeConfig};
use crate::error::JobError;
use crate::ffmpeg::{EngineExit, EngineProcess};
use crate::ffprobe;
use crate::job::{AudioChoice, CancelReason, JobKey, JobRequest, JobResult, JobSpec, JobState, ProgressSink};
use crate::progress::{drain_diagnostics, drain_output, ProgressTracker};
use crate::registry::{ActiveJob, JobHandle, JobRegistry};
use crate::select::StreamSelector;

/// Drives jobs from submission to a terminal state.
///
/// Controllers sharing one [`JobRegistry`] also share the one-job-per-input
/// rule: a submission for an input that already has an active job terminates
/// the older job first.
pub struct JobController {
    cfg: Arc<TranscodeConfig>,
    registry: Arc<JobRegistry>,
    selector: StreamSelector,
}

impl JobController {
    pub fn new(cfg: TranscodeConfig, registry: Arc<JobRegistry>) -> Self {
        let selector = StreamSelector::from_config(&cfg);
        JobController {
            cfg: Arc::new(cfg),
            registry,
            selector,
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Run one job to completion and report how it ended
    pub async fn submit(&self, request: JobRequest) -> JobResult {
        let JobRequest { input, output, progress } = request;
        let mut lifecycle = Lifecycle::new(Uuid::new_v4());
        info!("Job {}: Starting optimization for {}", lifecycle.id, input.display());

        let result = match self.prepare(&mut lifecycle, &input, output).await {
            Ok(spec) => self.run(&mut lifecycle, spec, progress).await,
            Err(e) => {
                lifecycle.advance(JobState::Failed, None);
                JobResult::Failed(e)
            }
        };

        match &result {
            JobResult::Success { output } => {
                info!("Job {}: Successfully optimized {} -> {}", lifecycle.id, input.display(), output.display())
            }
            JobResult::Failed(e) => error!("Job {}: Failed to optimize {}: {}", lifecycle.id, input.display(), e),
            JobResult::Cancelled(reason) => warn!("Job {}: Cancelled ({}): {}", lifecycle.id, reason, input.display()),
        }
        result
    }

    /// Cancel the active job for `input`, if there is one that can still be cancelled
    pub fn cancel(&self, input: &Path) -> bool {
        let Ok(key) = JobKey::for_input(input) else {
            return false;
        };
        match self.registry.lookup(&key) {
            Some(handle) => {
                let accepted = handle.cancel(CancelReason::Requested);
                if accepted {
                    info!("Job {}: Cancel requested for {}", handle.id(), key);
                } else {
                    debug!("Job {}: Cancel for {} ignored in state {:?}", handle.id(), key, handle.state());
                }
                accepted
            }
            None => false,
        }
    }

    /// State of the active job for `input`
    pub fn state(&self, input: &Path) -> Option<JobState> {
        let key = JobKey::for_input(input).ok()?;
        self.registry.lookup(&key).map(|h| h.state())
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.registry.snapshot()
    }

    /// Queued -> Probing -> Selecting: everything that happens before the job is registered
    async fn prepare(&self, lifecycle: &mut Lifecycle, input: &Path, output: PathBuf) -> Result<JobSpec, JobError> {
        let key = JobKey::resolve(input).await?;
        let meta = tokio::fs::metadata(key.path())
            .await
            .map_err(|e| JobError::InvalidInput(format!("{}: {}", input.display(), e)))?;
        if !meta.is_file() {
            return Err(JobError::InvalidInput(format!("{} is not a regular file", input.display())));
        }
        let modified = meta
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(
            "Job {}: Input {} ({}, modified {})",
            lifecycle.id,
            key,
            humansize::format_size(meta.len(), humansize::DECIMAL),
            modified
        );

        tokio::fs::create_dir_all(&self.cfg.temp_dir)
            .await
            .map_err(|e| JobError::io(format!("failed to create temp dir {}", self.cfg.temp_dir.display()), e))?;

        lifecycle.advance(JobState::Probing, None);
        let duration = ffprobe::probe_duration(&self.cfg, key.path()).await?;
        info!("Job {}: Duration {:.2}s", lifecycle.id, duration);

        lifecycle.advance(JobState::Selecting, None);
        let audio = self.select_audio(lifecycle.id, &key).await?;

        Ok(JobSpec::new(&self.cfg, lifecycle.id, key, output, audio, duration, meta.len()))
    }

    async fn select_audio(&self, job_id: Uuid, key: &JobKey) -> Result<AudioChoice, JobError> {
        let data = ffprobe::probe_streams(&self.cfg, key.path()).await?;
        let tracks = data.audio_tracks();
        debug!("Job {}: {} streams, {} audio", job_id, data.streams.len(), tracks.len());

        match self.selector.select(&tracks) {
            Ok(selection) => {
                info!("Job {}: Using audio stream {} ({:?})", job_id, selection.index, selection.tier);
                Ok(AudioChoice::Stream(selection.index))
            }
            Err(_) => match self.cfg.missing_audio {
                MissingAudioPolicy::Fail => Err(JobError::NoAudioStream(key.path().to_path_buf())),
                MissingAudioPolicy::VideoOnly => {
                    warn!("Job {}: No audio stream in {}, producing video-only output", job_id, key);
                    Ok(AudioChoice::None)
                }
            },
        }
    }

    /// Selecting -> Running -> terminal: the registered part of the job
    async fn run(&self, lifecycle: &mut Lifecycle, spec: JobSpec, progress: Option<ProgressSink>) -> JobResult {
        let handle = Arc::new(JobHandle::new(spec.id, spec.key.clone()));
        handle.set_state(JobState::Selecting);
        let artifacts = TempArtifacts::new(&spec);

        let previous = self.registry.register(spec.key.clone(), handle.clone());
        let guard = RegistrationGuard {
            registry: &self.registry,
            handle: handle.clone(),
            artifacts: artifacts.clone(),
        };

        if let Some(previous) = previous {
            info!("Job {}: Superseding job {} for {}", spec.id, previous.id(), spec.key);
            previous.terminate(CancelReason::Superseded).await;
            debug!("Job {}: Job {} torn down", spec.id, previous.id());
        }

        let result = match handle.cancel_reason() {
            Some(reason) => JobResult::Cancelled(reason),
            None => self.execute(lifecycle, &spec, &handle, &artifacts, progress).await,
        };

        if result.is_success() {
            artifacts.discard_progress().await;
        } else {
            artifacts.discard().await;
        }
        lifecycle.advance(result.state(), Some(&handle));
        drop(guard);
        result
    }

    async fn execute(
        &self,
        lifecycle: &mut Lifecycle,
        spec: &JobSpec,
        handle: &Arc<JobHandle>,
        artifacts: &TempArtifacts,
        progress: Option<ProgressSink>,
    ) -> JobResult {
        if let Err(e) = artifacts.prepare().await {
            return JobResult::Failed(e);
        }
        let mut process = match EngineProcess::start(&self.cfg, spec, handle.clone()) {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(e),
        };
        lifecycle.advance(JobState::Running, None);
        handle.mark_running();

        let exited = CancellationToken::new();
        let tracker = tokio::spawn(
            ProgressTracker::new(&self.cfg, spec).run(handle.clone(), exited.clone(), progress),
        );
        let diagnostics = process.take_stderr().map(|s| tokio::spawn(drain_diagnostics(spec.id, s)));
        let output = process.take_stdout().map(|s| tokio::spawn(drain_output(spec.id, s)));

        let exit = process.wait().await;
        exited.cancel();

        if let Err(e) = tracker.await {
            warn!("Job {}: Progress tracker task failed: {}", spec.id, e);
        }
        let stderr_tail = self.join_stream(spec.id, diagnostics).await.unwrap_or_default();
        self.join_stream(spec.id, output).await;

        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => return JobResult::Failed(e),
        };
        debug!("Job {}: Engine finished: {:?}", spec.id, exit);

        if let Some(reason) = handle.cancel_reason() {
            return JobResult::Cancelled(reason);
        }
        match exit {
            EngineExit::Terminated { .. } => JobResult::Cancelled(CancelReason::Requested),
            exit if !exit.success() => JobResult::Failed(JobError::EngineExit {
                code: exit.code(),
                stderr: stderr_tail.join("\n"),
            }),
            _ => {
                if let Err(reason) = handle.begin_commit() {
                    return JobResult::Cancelled(reason);
                }
                lifecycle.advance(JobState::Committing, None);
                match artifacts.commit(&spec.output).await {
                    Ok(()) => JobResult::Success {
                        output: spec.output.clone(),
                    },
                    Err(e) => JobResult::Failed(e),
                }
            }
        }
    }

    /// Join a stream reader, giving up once the grace period has passed.
    ///
    /// A grandchild of the engine can hold a pipe open after the engine is gone.
    async fn join_stream<T>(&self, job_id: Uuid, task: Option<JoinHandle<T>>) -> Option<T> {
        let mut task = task?;
        match tokio::time::timeout(self.cfg.grace_period(), &mut task).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Job {}: Stream reader task failed: {}", job_id, e);
                None
            }
            Err(_) => {
                warn!("Job {}: Engine pipe still open after exit, abandoning reader", job_id);
                task.abort();
                None
            }
        }
    }
}

/// Logs every state transition of one job and mirrors it onto its handle
struct Lifecycle {
    id: Uuid,
    state: JobState,
}

impl Lifecycle {
    fn new(id: Uuid) -> Self {
        Lifecycle {
            id,
            state: JobState::Queued,
        }
    }

    fn advance(&mut self, next: JobState, handle: Option<&JobHandle>) {
        info!("Job {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        if let Some(handle) = handle {
            handle.set_state(next);
        }
    }
}

/// Removes the job from the registry and releases waiters exactly once.
///
/// Also covers a `submit` future dropped mid-flight: the engine is told to
/// stop and the temp files are removed.
struct RegistrationGuard<'a> {
    registry: &'a JobRegistry,
    handle: Arc<JobHandle>,
    artifacts: TempArtifacts,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if !self.handle.state().is_terminal() {
            warn!("Job {}: Abandoned before reaching a terminal state", self.handle.id());
            self.handle.cancel(CancelReason::Requested);
            self.artifacts.discard_blocking();
        }
        self.registry.remove(self.handle.key(), self.handle.id());
        self.handle.mark_finished();
    }
}
