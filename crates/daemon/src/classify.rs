//! Codec classification and output container decisions.
//!
//! Codec strings reported by the extractor (`avc1.64001F`, `vp09.00.40.08`,
//! `mp4a.40.2`, ...) and by ffprobe (`h264`, `vp9`, `aac`, ...) are reduced
//! to a handful of families. The families of the chosen video and audio
//! streams decide the output container and whether the audio has to be
//! re-encoded for the container or the delivery target to accept it.

use serde::{Deserialize, Serialize};

/// Video codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    Avc,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    /// Present but not recognised, or not reported.
    #[default]
    Unknown,
    /// Explicitly absent (audio-only stream).
    None,
}

impl VideoCodec {
    /// Codecs that belong in an MP4 container.
    pub fn is_mpeg_family(self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }

    /// Codecs that belong in a WebM container.
    pub fn is_open_family(self) -> bool {
        matches!(self, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
    }
}

/// Audio codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Vorbis,
    #[default]
    Unknown,
    /// Explicitly absent (video-only stream).
    None,
}

impl AudioCodec {
    pub fn is_open_family(self) -> bool {
        matches!(self, AudioCodec::Opus | AudioCodec::Vorbis)
    }
}

/// Reduce a codec string to its video family.
pub fn video_codec_family(codec: Option<&str>) -> VideoCodec {
    let Some(codec) = codec.map(|c| c.trim().to_lowercase()) else {
        return VideoCodec::Unknown;
    };
    if codec.is_empty() {
        return VideoCodec::Unknown;
    }
    if codec == "none" {
        return VideoCodec::None;
    }
    if codec.starts_with("avc") || codec.starts_with("h264") || codec == "x264" {
        VideoCodec::Avc
    } else if codec.starts_with("hev")
        || codec.starts_with("hvc")
        || codec.starts_with("h265")
        || codec == "x265"
    {
        VideoCodec::Hevc
    } else if codec.starts_with("vp8") {
        VideoCodec::Vp8
    } else if codec.starts_with("vp9") || codec.starts_with("vp09") {
        VideoCodec::Vp9
    } else if codec.starts_with("av01") || codec.starts_with("av1") {
        VideoCodec::Av1
    } else {
        VideoCodec::Unknown
    }
}

/// Reduce a codec string to its audio family.
pub fn audio_codec_family(codec: Option<&str>) -> AudioCodec {
    let Some(codec) = codec.map(|c| c.trim().to_lowercase()) else {
        return AudioCodec::Unknown;
    };
    if codec.is_empty() {
        return AudioCodec::Unknown;
    }
    if codec == "none" {
        return AudioCodec::None;
    }
    if codec.starts_with("mp4a") || codec.starts_with("aac") {
        AudioCodec::Aac
    } else if codec.starts_with("opus") {
        AudioCodec::Opus
    } else if codec.starts_with("vorbis") {
        AudioCodec::Vorbis
    } else if codec == "mp3" || codec.starts_with("mp4a.6b") || codec.starts_with("mp4a.69") {
        AudioCodec::Mp3
    } else {
        AudioCodec::Unknown
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Mp4,
    Webm,
    Mkv,
    M4a,
    Mp3,
    Opus,
    Ogg,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
            Container::Mkv => "mkv",
            Container::M4a => "m4a",
            Container::Mp3 => "mp3",
            Container::Opus => "opus",
            Container::Ogg => "ogg",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(
            self,
            Container::M4a | Container::Mp3 | Container::Opus | Container::Ogg
        )
    }

    /// Whether the sink can stream this container inline.
    pub fn is_streamable(self) -> bool {
        matches!(self, Container::Mp4 | Container::M4a | Container::Mp3)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp4" | "m4v" | "mov" => Some(Container::Mp4),
            "webm" => Some(Container::Webm),
            "mkv" => Some(Container::Mkv),
            "m4a" | "aac" => Some(Container::M4a),
            "mp3" => Some(Container::Mp3),
            "opus" => Some(Container::Opus),
            "ogg" | "oga" => Some(Container::Ogg),
            _ => None,
        }
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Target of an audio re-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioTarget {
    Aac,
    Opus,
}

/// Outcome of the container decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPlan {
    pub container: Container,
    /// Re-encode audio to this codec, with loudness normalization.
    pub audio_transcode: Option<AudioTarget>,
}

impl ContainerPlan {
    fn keep(container: Container) -> Self {
        Self {
            container,
            audio_transcode: None,
        }
    }

    fn transcode(container: Container, target: AudioTarget) -> Self {
        Self {
            container,
            audio_transcode: Some(target),
        }
    }
}

/// Pick the output container and any audio transcode for a stream pair.
///
/// `require_aac` is set when the delivery target only plays AAC audio.
pub fn decide_container(video: VideoCodec, audio: AudioCodec, require_aac: bool) -> ContainerPlan {
    if video == VideoCodec::None {
        return decide_audio_only(audio, require_aac);
    }

    let has_audio = audio != AudioCodec::None;
    let needs_aac = require_aac && has_audio && audio != AudioCodec::Aac;

    if video.is_mpeg_family() {
        return match audio {
            AudioCodec::Aac | AudioCodec::None => ContainerPlan::keep(Container::Mp4),
            AudioCodec::Mp3 if !require_aac => ContainerPlan::keep(Container::Mp4),
            // opus/vorbis in mp4 is poorly supported by players
            _ => ContainerPlan::transcode(Container::Mp4, AudioTarget::Aac),
        };
    }

    if video.is_open_family() {
        if needs_aac {
            // VP8 has no standard mapping in MP4
            let container = if video == VideoCodec::Vp8 {
                Container::Mkv
            } else {
                Container::Mp4
            };
            return ContainerPlan::transcode(container, AudioTarget::Aac);
        }
        return match audio {
            AudioCodec::Opus | AudioCodec::Vorbis | AudioCodec::None => {
                ContainerPlan::keep(Container::Webm)
            }
            AudioCodec::Aac => ContainerPlan::keep(Container::Mkv),
            AudioCodec::Mp3 | AudioCodec::Unknown => {
                ContainerPlan::transcode(Container::Webm, AudioTarget::Opus)
            }
        };
    }

    // unknown video codec: mkv accepts anything
    if needs_aac {
        ContainerPlan::transcode(Container::Mkv, AudioTarget::Aac)
    } else {
        ContainerPlan::keep(Container::Mkv)
    }
}

fn decide_audio_only(audio: AudioCodec, require_aac: bool) -> ContainerPlan {
    match audio {
        AudioCodec::Aac => ContainerPlan::keep(Container::M4a),
        _ if require_aac => ContainerPlan::transcode(Container::M4a, AudioTarget::Aac),
        AudioCodec::Mp3 => ContainerPlan::keep(Container::Mp3),
        AudioCodec::Opus => ContainerPlan::keep(Container::Opus),
        AudioCodec::Vorbis => ContainerPlan::keep(Container::Ogg),
        AudioCodec::Unknown | AudioCodec::None => {
            ContainerPlan::transcode(Container::M4a, AudioTarget::Aac)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_video_families() {
        assert_eq!(video_codec_family(Some("avc1.64001F")), VideoCodec::Avc);
        assert_eq!(video_codec_family(Some("h264")), VideoCodec::Avc);
        assert_eq!(video_codec_family(Some("hvc1.1.6.L93.B0")), VideoCodec::Hevc);
        assert_eq!(video_codec_family(Some("hevc")), VideoCodec::Hevc);
        assert_eq!(video_codec_family(Some("vp09.00.40.08")), VideoCodec::Vp9);
        assert_eq!(video_codec_family(Some("vp9")), VideoCodec::Vp9);
        assert_eq!(video_codec_family(Some("vp8")), VideoCodec::Vp8);
        assert_eq!(video_codec_family(Some("av01.0.08M.08")), VideoCodec::Av1);
        assert_eq!(video_codec_family(Some("none")), VideoCodec::None);
        assert_eq!(video_codec_family(None), VideoCodec::Unknown);
        assert_eq!(video_codec_family(Some("theora")), VideoCodec::Unknown);
    }

    #[test]
    fn test_audio_families() {
        assert_eq!(audio_codec_family(Some("mp4a.40.2")), AudioCodec::Aac);
        assert_eq!(audio_codec_family(Some("aac")), AudioCodec::Aac);
        assert_eq!(audio_codec_family(Some("opus")), AudioCodec::Opus);
        assert_eq!(audio_codec_family(Some("vorbis")), AudioCodec::Vorbis);
        assert_eq!(audio_codec_family(Some("mp3")), AudioCodec::Mp3);
        assert_eq!(audio_codec_family(Some("none")), AudioCodec::None);
        assert_eq!(audio_codec_family(Some("")), AudioCodec::Unknown);
    }

    #[test]
    fn test_container_table() {
        let cases = [
            (VideoCodec::Avc, AudioCodec::Aac, false, Container::Mp4, None),
            (VideoCodec::Hevc, AudioCodec::Aac, true, Container::Mp4, None),
            (VideoCodec::Avc, AudioCodec::Opus, false, Container::Mp4, Some(AudioTarget::Aac)),
            (VideoCodec::Vp9, AudioCodec::Opus, false, Container::Webm, None),
            (VideoCodec::Av1, AudioCodec::Vorbis, false, Container::Webm, None),
            (VideoCodec::Vp9, AudioCodec::Aac, false, Container::Mkv, None),
            (VideoCodec::Vp9, AudioCodec::Opus, true, Container::Mp4, Some(AudioTarget::Aac)),
            (VideoCodec::Vp8, AudioCodec::Vorbis, true, Container::Mkv, Some(AudioTarget::Aac)),
            (VideoCodec::Vp9, AudioCodec::Mp3, false, Container::Webm, Some(AudioTarget::Opus)),
            (VideoCodec::Unknown, AudioCodec::Unknown, false, Container::Mkv, None),
            (VideoCodec::Avc, AudioCodec::None, true, Container::Mp4, None),
        ];
        for (video, audio, require_aac, container, transcode) in cases {
            let plan = decide_container(video, audio, require_aac);
            assert_eq!(plan.container, container, "{video:?}+{audio:?} aac={require_aac}");
            assert_eq!(plan.audio_transcode, transcode, "{video:?}+{audio:?} aac={require_aac}");
        }
    }

    #[test]
    fn test_audio_only_containers() {
        assert_eq!(
            decide_container(VideoCodec::None, AudioCodec::Aac, true),
            ContainerPlan::keep(Container::M4a)
        );
        assert_eq!(
            decide_container(VideoCodec::None, AudioCodec::Opus, true),
            ContainerPlan::transcode(Container::M4a, AudioTarget::Aac)
        );
        assert_eq!(
            decide_container(VideoCodec::None, AudioCodec::Opus, false),
            ContainerPlan::keep(Container::Opus)
        );
        assert_eq!(
            decide_container(VideoCodec::None, AudioCodec::Mp3, false),
            ContainerPlan::keep(Container::Mp3)
        );
    }

    #[test]
    fn test_container_extensions() {
        assert_eq!(Container::from_extension("MP4"), Some(Container::Mp4));
        assert_eq!(Container::from_extension("m4v"), Some(Container::Mp4));
        assert_eq!(Container::from_extension("flv"), None);
        assert_eq!(Container::Webm.to_string(), "webm");
        assert!(Container::Mp4.is_streamable());
        assert!(!Container::Mkv.is_streamable());
    }

    fn video_strategy() -> impl Strategy<Value = VideoCodec> {
        prop_oneof![
            Just(VideoCodec::Avc),
            Just(VideoCodec::Hevc),
            Just(VideoCodec::Vp8),
            Just(VideoCodec::Vp9),
            Just(VideoCodec::Av1),
            Just(VideoCodec::Unknown),
            Just(VideoCodec::None),
        ]
    }

    fn audio_strategy() -> impl Strategy<Value = AudioCodec> {
        prop_oneof![
            Just(AudioCodec::Aac),
            Just(AudioCodec::Mp3),
            Just(AudioCodec::Opus),
            Just(AudioCodec::Vorbis),
            Just(AudioCodec::Unknown),
            Just(AudioCodec::None),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // With the AAC requirement, any audio that ends up in the output is
        // either already AAC or scheduled for an AAC transcode.
        #[test]
        fn prop_require_aac_is_honoured(video in video_strategy(), audio in audio_strategy()) {
            let plan = decide_container(video, audio, true);
            if audio != AudioCodec::None && audio != AudioCodec::Aac {
                prop_assert_eq!(plan.audio_transcode, Some(AudioTarget::Aac));
            }
            if audio == AudioCodec::Aac {
                prop_assert_eq!(plan.audio_transcode, None);
            }
        }

        // WebM never carries AAC, MP4 never keeps Opus or Vorbis.
        #[test]
        fn prop_container_codec_compatibility(
            video in video_strategy(),
            audio in audio_strategy(),
            require_aac in any::<bool>(),
        ) {
            let plan = decide_container(video, audio, require_aac);
            let final_audio = match plan.audio_transcode {
                Some(AudioTarget::Aac) => AudioCodec::Aac,
                Some(AudioTarget::Opus) => AudioCodec::Opus,
                None => audio,
            };
            if plan.container == Container::Webm {
                prop_assert!(final_audio != AudioCodec::Aac);
            }
            if plan.container == Container::Mp4 {
                prop_assert!(!final_audio.is_open_family());
            }
            prop_assert_eq!(plan.container.is_audio_only(), video == VideoCodec::None);
        }
    }
}
