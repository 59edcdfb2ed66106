use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// What to do when the input has no audio track at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAudioPolicy {
    /// Fail the job with `NoAudioStream`
    Fail,
    /// Transcode the video stream alone (`-an`)
    VideoOnly,
}

/// Codec, filter and metadata parameters passed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingParams {
    /// Video codec; `copy` remuxes the first video stream untouched
    pub video_codec: String,
    /// Encoder preset, ignored when the video is copied
    pub video_preset: Option<String>,
    /// Encoder CRF, ignored when the video is copied
    pub video_crf: Option<u8>,
    pub audio_codec: String,
    pub audio_channels: u8,
    pub audio_bitrate: String,
    /// Loudness normalisation / dialog clarity filter chain
    pub audio_filter: String,
    /// Title tag written to the retained audio track
    pub audio_title: String,
    /// Language tag written to the retained audio track
    pub audio_language: String,
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            video_codec: "copy".to_string(),
            video_preset: None,
            video_crf: None,
            audio_codec: "ac3".to_string(),
            audio_channels: 2,
            audio_bitrate: "384k".to_string(),
            audio_filter: "volume=1.5,dynaudnorm=f=150:g=15:p=0.7,loudnorm=I=-16:TP=-1.5:LRA=11"
                .to_string(),
            audio_title: "2.1 Optimized".to_string(),
            audio_language: "eng".to_string(),
        }
    }
}

/// Configuration for the transcoding supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Working directory for temp outputs and progress files
    pub temp_dir: PathBuf,
    /// Language code matched against the audio `language` tag
    pub target_language: String,
    /// Language name searched for in the audio `title` tag
    pub target_language_name: String,
    /// Channel counts accepted by the channel-layout tier
    pub preferred_channels: Vec<u32>,
    pub missing_audio: MissingAudioPolicy,
    /// Seconds without forward progress before a running job is cancelled
    pub stall_timeout_secs: u64,
    /// Seconds between the polite termination signal and the forced kill
    pub grace_period_secs: u64,
    /// Sleep between polls of the progress and diagnostic feeds
    pub poll_interval_ms: u64,
    /// How long the progress feed is still tailed after the engine exits
    pub drain_period_ms: u64,
    /// Hard limit on a single job's running time
    pub max_runtime_secs: u64,
    /// Explicit engine thread count; defaults to the available parallelism
    pub threads: Option<usize>,
    /// Inputs smaller than this are "small" for the thread policy (e.g., 10GB)
    pub small_file_threshold_bytes: u64,
    /// Halve the thread count for small inputs
    pub halve_threads_for_small_files: bool,
    /// Minimum age before a leftover temp file is swept at startup
    pub orphan_age_secs: u64,
    pub encoding: EncodingParams,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            temp_dir: std::env::temp_dir().join("ffmpeg_processing"),
            target_language: "eng".to_string(),
            target_language_name: "english".to_string(),
            preferred_channels: vec![6, 2],
            missing_audio: MissingAudioPolicy::Fail,
            stall_timeout_secs: 300,
            grace_period_secs: 5,
            poll_interval_ms: 100,
            drain_period_ms: 500,
            max_runtime_secs: 3 * 60 * 60,
            threads: None,
            small_file_threshold_bytes: 10 * 1024 * 1024 * 1024, // 10GB
            halve_threads_for_small_files: false,
            orphan_age_secs: 60 * 60,
            encoding: EncodingParams::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn orphan_age(&self) -> Duration {
        Duration::from_secs(self.orphan_age_secs)
    }

    /// Engine thread count for an input of `input_bytes`
    pub fn thread_count(&self, input_bytes: u64) -> usize {
        if let Some(threads) = self.threads {
            return threads.max(1);
        }

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        if self.halve_threads_for_small_files && input_bytes < self.small_file_threshold_bytes {
            (available / 2).max(1)
        } else {
            available
        }
    }
}
