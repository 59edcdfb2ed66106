use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mediaopt::{
    sweep_orphaned_temp_files, JobController, JobRegistry, JobRequest, JobResult, JobState,
    MissingAudioPolicy, TranscodeConfig,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Optimize a video file for playback on a stereo setup
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input video file
    input: PathBuf,

    /// Output path (default: <stem>_optimized.<ext> next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for temp outputs and progress files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Preferred audio language tag (e.g. eng)
    #[arg(long)]
    language: Option<String>,

    /// Language name to look for in track titles (e.g. english)
    #[arg(long)]
    language_name: Option<String>,

    /// Produce a video-only output when the input has no audio
    #[arg(long)]
    video_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

fn init_logging(args: &Args) -> Result<()> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    builder.format_timestamp_secs();

    if let Some(path) = &args.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn apply_overrides(cfg: &mut TranscodeConfig, args: &Args) {
    if let Some(dir) = &args.temp_dir {
        cfg.temp_dir = dir.clone();
    }
    if let Some(lang) = &args.language {
        cfg.target_language = lang.clone();
    }
    if let Some(name) = &args.language_name {
        cfg.target_language_name = name.clone();
    }
    if args.video_only {
        cfg.missing_audio = MissingAudioPolicy::VideoOnly;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// The job is stopping, or finishing its publish; keep awaiting it
    Wait,
    /// No registered job yet; drop the submission
    Abandon,
}

fn interrupt_action(cancel_accepted: bool, state: Option<JobState>) -> Interrupt {
    if cancel_accepted {
        return Interrupt::Wait;
    }
    match state {
        Some(JobState::Committing) => Interrupt::Wait,
        _ => Interrupt::Abandon,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    apply_overrides(&mut cfg, &args);

    info!("Configuration loaded:");
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  ffprobe: {}", cfg.ffprobe_bin.display());
    info!("  Temp dir: {}", cfg.temp_dir.display());
    info!("  Audio language: {} ({})", cfg.target_language, cfg.target_language_name);
    info!("  Stall timeout: {}s", cfg.stall_timeout_secs);

    match sweep_orphaned_temp_files(&cfg).await {
        Ok(0) => {}
        Ok(n) => info!("Startup cleanup removed {} orphaned temp file(s)", n),
        Err(e) => warn!("Startup cleanup failed: {:#}", e),
    }

    let controller = JobController::new(cfg, Arc::new(JobRegistry::new()));

    let mut request = JobRequest::new(&args.input);
    if let Some(output) = &args.output {
        request = request.with_output(output);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
    let printer = tokio::spawn(async move {
        let mut stderr = std::io::stderr();
        let mut printed = false;
        while let Some(percent) = rx.recv().await {
            let _ = write!(stderr, "\rProgress: {:6.2}%", percent);
            let _ = stderr.flush();
            printed = true;
        }
        if printed {
            let _ = writeln!(stderr);
        }
    });

    let mut job = Box::pin(controller.submit(request.with_progress(tx)));

    // Ctrl-C cancels a running job and waits for its cleanup. Before the job
    // is registered there is nothing to cancel, so the submission is dropped.
    let result = loop {
        tokio::select! {
            result = &mut job => break Some(result),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for interrupts: {}", e);
                    break Some((&mut job).await);
                }
                let accepted = controller.cancel(&args.input);
                match interrupt_action(accepted, controller.state(&args.input)) {
                    Interrupt::Wait => warn!("Interrupt received, waiting for {} to stop", args.input.display()),
                    Interrupt::Abandon => {
                        warn!("Interrupt received before the engine started, abandoning {}", args.input.display());
                        break None;
                    }
                }
            }
        }
    };
    drop(job);
    let _ = printer.await;

    let code = match result {
        None => ExitCode::from(EXIT_CANCELLED),
        Some(JobResult::Success { output }) => {
            let size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
            info!(
                "✅ Output written to {} ({})",
                output.display(),
                humansize::format_size(size, humansize::DECIMAL)
            );
            ExitCode::SUCCESS
        }
        Some(JobResult::Failed(e)) => {
            error!("❌ Optimization failed: {}", e);
            ExitCode::from(EXIT_FAILURE)
        }
        Some(JobResult::Cancelled(reason)) => {
            warn!("Optimization cancelled: {}", reason);
            ExitCode::from(EXIT_CANCELLED)
        }
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_before_registration_abandons() {
        assert_eq!(interrupt_action(false, None), Interrupt::Abandon);
    }

    #[test]
    fn test_interrupt_waits_for_cancelled_or_committing_job() {
        assert_eq!(interrupt_action(true, Some(JobState::Running)), Interrupt::Wait);
        assert_eq!(interrupt_action(false, Some(JobState::Committing)), Interrupt::Wait);
        assert_eq!(interrupt_action(false, Some(JobState::Completed)), Interrupt::Abandon);
    }
}
