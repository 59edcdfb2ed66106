use log::info;
use thiserror::Error;

use crate::config::TranscodeConfig;

/// One probed audio track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    /// Absolute stream index in the container
    pub index: i32,
    pub channels: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
}

/// The input carries no audio track at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no audio stream")]
pub struct NoAudioStream;

/// Which rule picked the track, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectionTier {
    LanguageTag,
    TitleName,
    ChannelLayout,
    FirstTrack,
}

impl SelectionTier {
    pub const ALL: [SelectionTier; 4] = [
        SelectionTier::LanguageTag,
        SelectionTier::TitleName,
        SelectionTier::ChannelLayout,
        SelectionTier::FirstTrack,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: i32,
    pub tier: SelectionTier,
}

/// Tiered audio track selection; the first tier with a match wins
#[derive(Debug, Clone)]
pub struct StreamSelector {
    language: String,
    language_name: String,
    preferred_channels: Vec<u32>,
}

impl StreamSelector {
    pub fn new(language: &str, language_name: &str, preferred_channels: &[u32]) -> Self {
        StreamSelector {
            language: language.to_lowercase(),
            language_name: language_name.to_lowercase(),
            preferred_channels: preferred_channels.to_vec(),
        }
    }

    pub fn from_config(cfg: &TranscodeConfig) -> Self {
        Self::new(&cfg.target_language, &cfg.target_language_name, &cfg.preferred_channels)
    }

    /// Pick one track from `tracks`. Within a tier the lowest stream index wins.
    pub fn select(&self, tracks: &[AudioTrack]) -> Result<Selection, NoAudioStream> {
        let mut ordered: Vec<&AudioTrack> = tracks.iter().collect();
        ordered.sort_by_key(|t| t.index);

        for tier in SelectionTier::ALL {
            if let Some(track) = ordered.iter().find(|t| self.matches(tier, t)) {
                info!("Selected audio stream {} ({:?})", track.index, tier);
                return Ok(Selection { index: track.index, tier });
            }
        }

        Err(NoAudioStream)
    }

    fn matches(&self, tier: SelectionTier, track: &AudioTrack) -> bool {
        match tier {
            SelectionTier::LanguageTag => self.matches_language(track),
            SelectionTier::TitleName => self.matches_title(track),
            SelectionTier::ChannelLayout => self.matches_channels(track),
            SelectionTier::FirstTrack => true,
        }
    }

    fn matches_language(&self, track: &AudioTrack) -> bool {
        track
            .language
            .as_deref()
            .map(|lang| lang.trim().eq_ignore_ascii_case(&self.language))
            .unwrap_or(false)
    }

    fn matches_title(&self, track: &AudioTrack) -> bool {
        !self.language_name.is_empty()
            && track
                .title
                .as_deref()
                .map(|title| title.to_lowercase().contains(&self.language_name))
                .unwrap_or(false)
    }

    fn matches_channels(&self, track: &AudioTrack) -> bool {
        track
            .channels
            .map(|c| self.preferred_channels.contains(&c))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn track(index: i32, channels: Option<u32>, language: Option<&str>, title: Option<&str>) -> AudioTrack {
        AudioTrack {
            index,
            channels,
            language: language.map(str::to_string),
            title: title.map(str::to_string),
        }
    }

    fn selector() -> StreamSelector {
        StreamSelector::new("eng", "english", &[6, 2])
    }

    #[test]
    fn test_language_tag_wins() {
        let tracks = vec![track(0, None, Some("eng"), None), track(1, None, Some("und"), None)];
        let selection = selector().select(&tracks).unwrap();
        assert_eq!(selection.index, 0);
        assert_eq!(selection.tier, SelectionTier::LanguageTag);
    }

    #[test]
    fn test_language_tag_is_case_insensitive_and_exact() {
        let tracks = vec![track(1, None, Some("english"), None), track(2, None, Some("ENG"), None)];
        assert_eq!(selector().select(&tracks).unwrap().index, 2);
    }

    #[test]
    fn test_title_substring() {
        let tracks = vec![
            track(0, None, Some("und"), Some("Director Commentary")),
            track(1, None, Some("und"), Some("English Stereo")),
        ];
        let selection = selector().select(&tracks).unwrap();
        assert_eq!(selection.index, 1);
        assert_eq!(selection.tier, SelectionTier::TitleName);
    }

    #[test]
    fn test_tiers_are_never_skipped() {
        // The 5.1 track would be "better", but a title match outranks channel layout
        let tracks = vec![
            track(1, Some(6), Some("und"), None),
            track(2, Some(1), Some("und"), Some("english mono")),
        ];
        assert_eq!(selector().select(&tracks).unwrap().index, 2);
    }

    #[test]
    fn test_channel_layout_then_first_track() {
        let tracks = vec![track(3, Some(1), None, None), track(4, Some(2), None, None), track(5, Some(6), None, None)];
        let selection = selector().select(&tracks).unwrap();
        assert_eq!(selection.index, 4);
        assert_eq!(selection.tier, SelectionTier::ChannelLayout);

        let tracks = vec![track(7, Some(1), None, None), track(8, Some(8), None, None)];
        let selection = selector().select(&tracks).unwrap();
        assert_eq!(selection.index, 7);
        assert_eq!(selection.tier, SelectionTier::FirstTrack);
    }

    #[test]
    fn test_ties_break_by_lowest_index() {
        let tracks = vec![track(9, None, Some("eng"), None), track(4, None, Some("eng"), None)];
        assert_eq!(selector().select(&tracks).unwrap().index, 4);
    }

    #[test]
    fn test_no_audio() {
        assert_eq!(selector().select(&[]), Err(NoAudioStream));
    }

    proptest! {
        #[test]
        fn test_selection_is_one_of_the_tracks(
            specs in prop::collection::vec(
                (0i32..32, prop::option::of(1u32..9), prop::option::of(prop_oneof![Just("eng"), Just("und"), Just("fre")])),
                1..8,
            )
        ) {
            let tracks: Vec<AudioTrack> = specs
                .iter()
                .map(|(i, c, l)| track(*i, *c, *l, None))
                .collect();
            let selection = selector().select(&tracks).unwrap();
            prop_assert!(tracks.iter().any(|t| t.index == selection.index));

            // A language match always beats every other tier
            if let Some(lowest_eng) = tracks.iter().filter(|t| t.language.as_deref() == Some("eng")).map(|t| t.index).min() {
                prop_assert_eq!(selection.index, lowest_eng);
                prop_assert_eq!(selection.tier, SelectionTier::LanguageTag);
            }
        }
    }
}
