use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::TranscodeConfig;
use crate::error::JobError;
use crate::job::{AudioChoice, CancelReason, JobSpec};
use crate::registry::JobHandle;

/// Command builder for the engine's argument vector
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the full engine argument vector for `spec`.
    ///
    /// The output is always `spec.temp_output`, never the destination path.
    pub fn build_args(&self, spec: &JobSpec) -> Vec<String> {
        let enc = &spec.encoding;
        let mut args: Vec<String> = Vec::new();

        args.push("-analyzeduration".to_string());
        args.push("100M".to_string());
        args.push("-probesize".to_string());
        args.push("100M".to_string());

        args.push("-i".to_string());
        args.push(spec.input.to_string_lossy().to_string());

        // First video stream, copied or recompressed
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-c:v".to_string());
        args.push(enc.video_codec.clone());
        if enc.video_codec != "copy" {
            if let Some(preset) = &enc.video_preset {
                args.push("-preset".to_string());
                args.push(preset.clone());
            }
            if let Some(crf) = enc.video_crf {
                args.push("-crf".to_string());
                args.push(crf.to_string());
            }
        }

        match spec.audio {
            AudioChoice::Stream(index) => {
                args.push("-map".to_string());
                args.push(format!("0:{}", index));
                args.push("-c:a".to_string());
                args.push(enc.audio_codec.clone());
                args.push("-ac".to_string());
                args.push(enc.audio_channels.to_string());
                args.push("-b:a".to_string());
                args.push(enc.audio_bitrate.clone());
                args.push("-af".to_string());
                args.push(enc.audio_filter.clone());
                args.push("-metadata:s:a:0".to_string());
                args.push(format!("title={}", enc.audio_title));
                args.push("-metadata:s:a:0".to_string());
                args.push(format!("language={}", enc.audio_language));
            }
            AudioChoice::None => {
                args.push("-an".to_string());
            }
        }

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push("-threads".to_string());
        args.push(spec.threads.to_string());
        args.push("-y".to_string());
        args.push("-nostdin".to_string());
        args.push("-progress".to_string());
        args.push(spec.progress_path.to_string_lossy().to_string());

        args.push(spec.temp_output.to_string_lossy().to_string());

        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// How the engine process ended
#[derive(Debug)]
pub enum EngineExit {
    /// Exited on its own
    Exited(ExitStatus),
    /// Stopped by [`terminate`]; `forced` if the grace period ran out
    Terminated { forced: bool },
}

impl EngineExit {
    pub fn success(&self) -> bool {
        matches!(self, EngineExit::Exited(status) if status.success())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            EngineExit::Exited(status) => status.code(),
            EngineExit::Terminated { .. } => None,
        }
    }
}

/// A running engine. A background waiter owns the child; cancelling the job
/// handle (or exceeding the runtime limit) routes through [`terminate`].
pub struct EngineProcess {
    waiter: JoinHandle<io::Result<EngineExit>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl EngineProcess {
    /// Spawn the engine for `spec` under the control of `handle`
    pub fn start(cfg: &TranscodeConfig, spec: &JobSpec, handle: Arc<JobHandle>) -> Result<Self, JobError> {
        let args = CommandBuilder::new().build_args(spec);
        info!("Job {}: Executing engine: {} {}", spec.id, cfg.ffmpeg_bin.display(), args.join(" "));

        let mut cmd = Command::new(&cfg.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| JobError::Spawn {
            bin: cfg.ffmpeg_bin.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let grace = cfg.grace_period();
        let max_runtime = cfg.max_runtime();
        let job_id = spec.id;

        let waiter = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => return status.map(EngineExit::Exited),
                _ = handle.cancellation().cancelled() => {}
                _ = tokio::time::sleep(max_runtime) => {
                    warn!("Job {}: runtime limit of {}s reached", job_id, max_runtime.as_secs());
                    handle.cancel(CancelReason::TimedOut { limit: max_runtime });
                }
            }
            let forced = terminate(&mut child, grace).await?;
            Ok(EngineExit::Terminated { forced })
        });

        debug!("Job {}: engine started (pid {:?})", spec.id, pid);
        Ok(EngineProcess {
            waiter,
            stdout,
            stderr,
        })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the engine to exit, or for a requested termination to complete
    pub async fn wait(self) -> Result<EngineExit, JobError> {
        match self.waiter.await {
            Ok(result) => result.map_err(|e| JobError::io("failed to wait for engine", e)),
            Err(e) => Err(JobError::io(
                "engine waiter task failed",
                io::Error::new(io::ErrorKind::Other, e.to_string()),
            )),
        }
    }
}

/// Two-phase termination: polite signal, up to `grace` to exit, then kill.
///
/// Returns whether the kill was needed. The only termination path, shared by
/// explicit cancel, superseding and stall detection.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<bool> {
    if let Some(status) = child.try_wait()? {
        debug!("Engine already exited ({})", status);
        return Ok(false);
    }

    if let Err(e) = send_polite_signal(child) {
        warn!("Failed to signal engine, killing instead: {}", e);
        child.kill().await?;
        return Ok(true);
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => {
            info!("Engine terminated gracefully ({})", status?);
            Ok(false)
        }
        Err(_) => {
            warn!("Engine still running after {}s grace period, killing", grace.as_secs());
            child.kill().await?;
            Ok(true)
        }
    }
}

#[cfg(unix)]
fn send_polite_signal(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "engine has no pid"))?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(not(unix))]
fn send_polite_signal(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
