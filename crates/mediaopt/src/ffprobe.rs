use std::collections::HashMap;
use std::path::Path;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::TranscodeConfig;
use crate::error::JobError;
use crate::select::AudioTrack;

/// Stream listing from `ffprobe -show_streams`
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub channels: Option<u32>,
    pub tags: Option<HashMap<String, String>>,
}

impl FFProbeStream {
    pub fn is_audio(&self) -> bool {
        self.codec_type.as_deref() == Some("audio")
    }

    /// Tag lookup ignoring key case (`language` vs `LANGUAGE` depends on the muxer)
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref().and_then(|tags| {
            tags.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        })
    }
}

impl FFProbeData {
    /// Audio streams in probe order
    pub fn audio_tracks(&self) -> Vec<AudioTrack> {
        self.streams
            .iter()
            .filter(|s| s.is_audio())
            .map(|s| AudioTrack {
                index: s.index,
                channels: s.channels,
                language: s.tag("language").map(str::to_string),
                title: s.tag("title").map(str::to_string),
            })
            .collect()
    }
}

/// Parse the single `format=duration` value; must be a positive number of seconds
pub fn parse_duration(output: &str) -> Result<f64, String> {
    let trimmed = output.trim();
    let duration: f64 = trimmed
        .parse()
        .map_err(|_| format!("unparsable duration: {:?}", trimmed))?;

    if !duration.is_finite() || duration <= 0.0 {
        return Err(format!("non-positive duration: {}", duration));
    }
    Ok(duration)
}

pub fn parse_streams(json: &str) -> Result<FFProbeData, String> {
    serde_json::from_str(json).map_err(|e| format!("failed to parse ffprobe JSON: {}", e))
}

/// Run ffprobe with `args` followed by the input path and return its stdout
async fn run_ffprobe(cfg: &TranscodeConfig, args: &[&str], input: &Path) -> Result<String, JobError> {
    debug!("ffprobe: {} {} {}", cfg.ffprobe_bin.display(), args.join(" "), input.display());

    let output = Command::new(&cfg.ffprobe_bin)
        .args(["-analyzeduration", "100M", "-probesize", "100M"])
        .args(args)
        .arg(input)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| JobError::probe(input, format!("failed to execute {}: {}", cfg.ffprobe_bin.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::probe(
            input,
            format!(
                "ffprobe failed (exit code {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        ));
    }

    String::from_utf8(output.stdout).map_err(|_| JobError::probe(input, "ffprobe output is not valid UTF-8"))
}

/// Total media duration of `input` in seconds
pub async fn probe_duration(cfg: &TranscodeConfig, input: &Path) -> Result<f64, JobError> {
    let stdout = run_ffprobe(
        cfg,
        &[
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ],
        input,
    )
    .await?;

    parse_duration(&stdout).map_err(|detail| JobError::probe(input, detail))
}

/// Typed stream listing of `input`
pub async fn probe_streams(cfg: &TranscodeConfig, input: &Path) -> Result<FFProbeData, JobError> {
    let stdout = run_ffprobe(cfg, &["-v", "error", "-print_format", "json", "-show_streams"], input).await?;
    parse_streams(&stdout).map_err(|detail| JobError::probe(input, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264"},
            {"index": 1, "codec_type": "audio", "codec_name": "dts", "channels": 6,
             "tags": {"language": "und", "title": "Director Commentary"}},
            {"index": 2, "codec_type": "audio", "codec_name": "aac", "channels": 2,
             "tags": {"LANGUAGE": "eng"}},
            {"index": 3, "codec_type": "subtitle", "codec_name": "subrip",
             "tags": {"language": "eng"}}
        ]
    }"#;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10.000000\n").unwrap(), 10.0);
        assert_eq!(parse_duration("  5400.5 ").unwrap(), 5400.5);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("-3.0").is_err());
    }

    #[test]
    fn test_audio_tracks_are_typed_in_probe_order() {
        let data = parse_streams(SAMPLE).unwrap();
        let tracks = data.audio_tracks();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].index, 1);
        assert_eq!(tracks[0].channels, Some(6));
        assert_eq!(tracks[0].title.as_deref(), Some("Director Commentary"));
        assert_eq!(tracks[1].index, 2);
        assert_eq!(tracks[1].language.as_deref(), Some("eng"));
        assert_eq!(tracks[1].title, None);
    }

    #[test]
    fn test_empty_listing() {
        let data = parse_streams("{}").unwrap();
        assert!(data.audio_tracks().is_empty());
        assert!(parse_streams("not json").is_err());
    }

    proptest! {
        #[test]
        fn test_non_positive_durations_rejected(secs in -1.0e6f64..=0.0) {
            prop_assert!(parse_duration(&secs.to_string()).is_err());
        }
    }
}
