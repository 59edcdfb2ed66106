use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TranscodeConfig;
use crate::job::{CancelReason, JobSpec, ProgressSink};
use crate::registry::JobHandle;

/// Number of trailing stderr lines kept for error reports
pub const STDERR_TAIL_LINES: usize = 20;

/// One interpreted progress feed line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSample {
    /// Completion in [0, 100]
    Percent(f64),
    /// Malformed or unrelated line; carries no signal
    Indeterminate,
}

/// Media time written so far, from an `out_time_ms=<microseconds>` line.
///
/// Despite the name the engine reports microseconds.
pub fn parse_out_time(line: &str) -> Option<f64> {
    let value = line.trim().strip_prefix("out_time_ms=")?;
    let micros: i64 = value.trim().parse().ok()?;
    Some(micros.max(0) as f64 / 1_000_000.0)
}

pub fn parse_sample(line: &str, total_duration: f64) -> ProgressSample {
    match parse_out_time(line) {
        Some(elapsed) if total_duration > 0.0 => {
            ProgressSample::Percent((elapsed / total_duration * 100.0).clamp(0.0, 100.0))
        }
        _ => ProgressSample::Indeterminate,
    }
}

/// Lets a sample through only if it is strictly greater than the last one let through
#[derive(Debug, Default)]
pub struct ProgressGate {
    last: Option<f64>,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, percent: f64) -> Option<f64> {
        if !percent.is_finite() {
            return None;
        }
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

/// Tails the engine's progress side-channel and watches for stalls
pub struct ProgressTracker {
    job_id: Uuid,
    path: PathBuf,
    total_duration: f64,
    poll_interval: Duration,
    drain_period: Duration,
    stall_timeout: Duration,
}

impl ProgressTracker {
    pub fn new(cfg: &TranscodeConfig, spec: &JobSpec) -> Self {
        ProgressTracker {
            job_id: spec.id,
            path: spec.progress_path.clone(),
            total_duration: spec.duration_secs,
            poll_interval: cfg.poll_interval(),
            drain_period: cfg.drain_period(),
            stall_timeout: cfg.stall_timeout(),
        }
    }

    /// Run until the engine has exited (`exited` fired) and the feed is drained.
    ///
    /// Samples go to `sink` in order, from this task only. A stall cancels the
    /// job through `handle`. Returns the last surfaced percentage.
    pub async fn run(
        self,
        handle: Arc<JobHandle>,
        exited: CancellationToken,
        sink: Option<ProgressSink>,
    ) -> Option<f64> {
        let mut gate = ProgressGate::new();
        let mut reader: Option<BufReader<File>> = None;
        let mut line: Vec<u8> = Vec::new();
        let mut drain_deadline: Option<Instant> = None;
        let mut ended = false;

        loop {
            if reader.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => reader = Some(BufReader::new(file)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Job {}: cannot open progress feed {}: {}", self.job_id, self.path.display(), e),
                }
            }

            let mut reopen = false;
            if let Some(r) = reader.as_mut() {
                loop {
                    match r.read_until(b'\n', &mut line).await {
                        Ok(0) => break,
                        // Partial line: keep it buffered until the rest is flushed
                        Ok(_) if line.last() != Some(&b'\n') => continue,
                        Ok(_) => {
                            let decoded = String::from_utf8_lossy(&line).into_owned();
                            line.clear();
                            let text = decoded.trim();
                            if text == "progress=end" {
                                ended = true;
                            }
                            if handle.cancel_reason().is_none() {
                                self.surface(parse_sample(text, self.total_duration), &mut gate, &handle, sink.as_ref());
                            }
                        }
                        Err(e) => {
                            // Reopen from the start; the gate drops anything already surfaced
                            warn!("Job {}: progress reading error: {}", self.job_id, e);
                            reopen = true;
                            line.clear();
                            break;
                        }
                    }
                }
            }
            if reopen {
                reader = None;
            }

            if exited.is_cancelled() {
                if handle.cancel_reason().is_some() || ended {
                    break;
                }
                let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + self.drain_period);
                if Instant::now() >= deadline {
                    break;
                }
            } else if handle.cancel_reason().is_none() {
                let idle = handle.idle_for();
                if idle >= self.stall_timeout {
                    warn!(
                        "Job {}: no progress for {}s (limit {}s), cancelling",
                        self.job_id,
                        idle.as_secs(),
                        self.stall_timeout.as_secs()
                    );
                    handle.cancel(CancelReason::Stalled { idle });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        if let Some(last) = gate.last() {
            info!("Job {}: final progress {:.2}%", self.job_id, last);
        }
        gate.last()
    }

    fn surface(&self, sample: ProgressSample, gate: &mut ProgressGate, handle: &JobHandle, sink: Option<&ProgressSink>) {
        let ProgressSample::Percent(percent) = sample else {
            return;
        };
        if let Some(percent) = gate.offer(percent) {
            handle.record_progress();
            debug!("Job {}: progress {:.2}%", self.job_id, percent);
            if let Some(sink) = sink {
                // A dropped receiver only means nobody is listening
                let _ = sink.send(percent);
            }
        }
    }
}

/// Heuristic for diagnostic lines worth a warning; never decides the outcome
pub fn looks_like_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("fail")
}

/// Drain the engine's diagnostic stream line by line, returning its tail
pub async fn drain_diagnostics<R>(job_id: Uuid, stream: R) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                debug!("Job {}: engine stderr: {}", job_id, text);
                if looks_like_error(&text) {
                    warn!("Job {}: potential engine error: {}", job_id, text);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
            Err(e) => {
                warn!("Job {}: diagnostic stream error: {}", job_id, e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}

/// Drain the engine's stdout so it can never block on a full pipe
pub async fn drain_output<R>(job_id: Uuid, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!("Job {}: engine stdout: {}", job_id, String::from_utf8_lossy(&buf).trim_end()),
        }
    }
}
