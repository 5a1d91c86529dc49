//! ffprobe inspection of produced files.
//!
//! The trimmer needs the real duration and codecs of what was downloaded,
//! and the compatibility step re-checks the audio codec after merging, so
//! both probe the file instead of trusting extractor metadata.

use crate::classify::{audio_codec_family, video_codec_family, AudioCodec, VideoCodec};
use crate::error::PipelineError;
use crate::process::{CommandSpec, ProcessError, ProcessRunner};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or exited non-zero.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),
}

impl From<ProbeError> for PipelineError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Process(p) => p.into(),
            ProbeError::Parse(msg) => PipelineError::fatal(format!("ffprobe: {}", msg)),
        }
    }
}

/// Result of probing a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Container duration in seconds, when reported.
    pub duration_secs: Option<f64>,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub width: u32,
    pub height: u32,
    pub size_bytes: Option<u64>,
}

impl ProbeResult {
    pub fn has_video(&self) -> bool {
        self.video_codec != VideoCodec::None
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec != AudioCodec::None
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// `ffprobe -v error -print_format json -show_streams -show_format <path>`
pub fn build_probe_command(ffprobe: &str, path: &Path) -> CommandSpec {
    CommandSpec::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .path_arg(path)
}

/// Parses ffprobe JSON output into a [`ProbeResult`].
///
/// Only the first real video stream counts; cover art is ignored.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let mut result = ProbeResult {
        video_codec: VideoCodec::None,
        audio_codec: AudioCodec::None,
        ..ProbeResult::default()
    };

    for stream in ffprobe.streams.unwrap_or_default() {
        let is_cover = stream
            .disposition
            .as_ref()
            .map(|d| d.attached_pic != 0)
            .unwrap_or(false);
        match stream.codec_type.as_deref() {
            Some("video") if !is_cover && !result.has_video() => {
                result.video_codec = video_codec_family(stream.codec_name.as_deref());
                result.width = stream.width.unwrap_or(0);
                result.height = stream.height.unwrap_or(0);
            }
            Some("audio") if !result.has_audio() => {
                result.audio_codec = audio_codec_family(stream.codec_name.as_deref());
            }
            _ => {}
        }
    }

    if let Some(format) = ffprobe.format {
        result.duration_secs = format
            .duration
            .as_ref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);
        result.size_bytes = format.size.as_ref().and_then(|s| s.parse::<u64>().ok());
    }

    Ok(result)
}

/// Probe `path` through `runner`.
pub async fn probe_file(
    runner: &dyn ProcessRunner,
    ffprobe: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ProbeResult, ProbeError> {
    let spec = build_probe_command(ffprobe, path);
    let output = runner.run(&spec, None, cancel).await?;
    parse_ffprobe_output(&output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output_basic() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080
                },
                {
                    "codec_type": "audio",
                    "codec_name": "opus"
                }
            ],
            "format": {
                "duration": "212.48",
                "size": "52548578"
            }
        }"#;

        let result = parse_ffprobe_output(json).expect("Should parse valid JSON");
        assert_eq!(result.video_codec, VideoCodec::Avc);
        assert_eq!(result.audio_codec, AudioCodec::Opus);
        assert_eq!((result.width, result.height), (1920, 1080));
        assert!((result.duration_secs.unwrap() - 212.48).abs() < 0.001);
        assert_eq!(result.size_bytes, Some(52548578));
    }

    #[test]
    fn test_parse_ffprobe_output_audio_only_with_cover() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "mjpeg",
                    "disposition": {"attached_pic": 1}
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac"
                }
            ],
            "format": {"duration": "60.0"}
        }"#;

        let result = parse_ffprobe_output(json).expect("Should parse JSON with cover art");
        assert!(!result.has_video());
        assert!(result.has_audio());
        assert_eq!(result.audio_codec, AudioCodec::Aac);
    }

    #[test]
    fn test_parse_ffprobe_output_missing_optional_fields() {
        let json = r#"{"streams": [{"codec_type": "video", "codec_name": "vp9"}]}"#;

        let result = parse_ffprobe_output(json).expect("Should parse without format");
        assert_eq!(result.video_codec, VideoCodec::Vp9);
        assert!(!result.has_audio());
        assert_eq!(result.duration_secs, None);
        assert_eq!(result.width, 0);
    }

    #[test]
    fn test_parse_ffprobe_output_invalid() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_probe_command_shape() {
        let spec = build_probe_command("/usr/bin/ffprobe", Path::new("/w/a b.mp4"));
        assert_eq!(spec.program, "/usr/bin/ffprobe");
        assert_eq!(spec.arg_value("-print_format"), Some("json"));
        assert!(spec.has_arg("-show_streams"));
        assert_eq!(spec.args.last().map(String::as_str), Some("/w/a b.mp4"));
    }

    #[test]
    fn test_parse_error_maps_to_fatal() {
        let err: PipelineError = ProbeError::Parse("eof".into()).into();
        assert_eq!(err.kind, crate::error::ErrorKind::Fatal);
    }
}
