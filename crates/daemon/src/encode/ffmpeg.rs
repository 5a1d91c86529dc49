//! ffmpeg command builders for post-processing.
//!
//! Every builder returns a [`CommandSpec`]; execution goes through the
//! job's [`ProcessRunner`] so cancellation kills the transcoder too.

use crate::classify::{AudioTarget, Container, VideoCodec};
use crate::error::PipelineError;
use crate::process::{CommandSpec, ProcessRunner};
use crate::sponsor::Interval;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// EBU R128 loudness target applied whenever audio is re-encoded
pub const LOUDNORM_FILTER: &str = "loudnorm=I=-16:TP=-1.5:LRA=11";

/// Peak limiter applied after mixing external audio
const LIMITER_FILTER: &str = "alimiter=limit=0.95";

/// How external audio is combined with the original track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MixMode {
    /// Weighted mix of both tracks.
    Mix { original: f32, external: f32 },
    /// Drop the original track.
    Replace,
}

impl Default for MixMode {
    fn default() -> Self {
        MixMode::Mix {
            original: 0.3,
            external: 1.0,
        }
    }
}

fn base(ffmpeg: &str) -> CommandSpec {
    CommandSpec::new(ffmpeg).args(["-hide_banner", "-nostdin", "-y"])
}

fn secs(value: f64) -> String {
    format!("{:.3}", value.max(0.0))
}

fn with_faststart(spec: CommandSpec, output: &Path) -> CommandSpec {
    let is_mp4 = output
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Container::from_extension)
        .map(|c| matches!(c, Container::Mp4 | Container::M4a))
        .unwrap_or(false);
    if is_mp4 {
        spec.args(["-movflags", "+faststart"])
    } else {
        spec
    }
}

fn audio_codec_args(target: AudioTarget) -> [&'static str; 4] {
    match target {
        AudioTarget::Aac => ["-c:a", "aac", "-b:a", "192k"],
        AudioTarget::Opus => ["-c:a", "libopus", "-b:a", "128k"],
    }
}

/// Re-encode the audio track, copying video, with loudness normalization.
///
/// # Arguments
/// * `ffmpeg` - Path to the ffmpeg binary
/// * `input` - Downloaded file
/// * `output` - Destination; its extension picks the muxer
/// * `target` - Audio codec to encode to
pub fn build_audio_transcode(
    ffmpeg: &str,
    input: &Path,
    output: &Path,
    target: AudioTarget,
) -> CommandSpec {
    let spec = base(ffmpeg)
        .arg("-i")
        .path_arg(input)
        .args(["-map", "0:v?", "-map", "0:a?", "-c:v", "copy"])
        .args(audio_codec_args(target))
        .args(["-af", LOUDNORM_FILTER]);
    with_faststart(spec, output).path_arg(output)
}

/// Copy every stream into another container.
pub fn build_remux(ffmpeg: &str, input: &Path, output: &Path) -> CommandSpec {
    let spec = base(ffmpeg)
        .arg("-i")
        .path_arg(input)
        .args(["-map", "0:v?", "-map", "0:a?", "-c", "copy"]);
    with_faststart(spec, output).path_arg(output)
}

/// Mux an external audio track (e.g. a voice-over) into a video.
pub fn build_external_audio_mux(
    ffmpeg: &str,
    video: &Path,
    external_audio: &str,
    output: &Path,
    mode: MixMode,
) -> CommandSpec {
    let graph = match mode {
        MixMode::Mix { original, external } => format!(
            "[0:a][1:a]amix=inputs=2:weights='{original} {external}':duration=first:dropout_transition=0:normalize=0,{LOUDNORM_FILTER},{LIMITER_FILTER}[aout]"
        ),
        MixMode::Replace => format!("[1:a]{LOUDNORM_FILTER},{LIMITER_FILTER}[aout]"),
    };
    let spec = base(ffmpeg)
        .arg("-i")
        .path_arg(video)
        .args(["-i", external_audio])
        .args(["-filter_complex", graph.as_str()])
        .args(["-map", "0:v:0", "-map", "[aout]", "-c:v", "copy"])
        .args(audio_codec_args(AudioTarget::Aac))
        .arg("-shortest");
    with_faststart(spec, output).path_arg(output)
}

/// Stream-copy one keep-range into its own file.
pub fn build_cut(ffmpeg: &str, input: &Path, range: &Interval, output: &Path) -> CommandSpec {
    base(ffmpeg)
        .args(["-ss", secs(range.start).as_str(), "-to", secs(range.end).as_str()])
        .arg("-i")
        .path_arg(input)
        .args(["-map", "0", "-c", "copy", "-avoid_negative_ts", "make_zero"])
        .path_arg(output)
}

/// Body of a concat-demuxer list file.
///
/// Single quotes in paths are escaped the way the demuxer expects.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Lossless container-level concat of parts listed in `list_file`.
pub fn build_concat_demuxer(ffmpeg: &str, list_file: &Path, output: &Path) -> CommandSpec {
    let spec = base(ffmpeg)
        .args(["-f", "concat", "-safe", "0", "-i"])
        .path_arg(list_file)
        .args(["-map", "0", "-c", "copy"]);
    with_faststart(spec, output).path_arg(output)
}

/// Remux one part into MPEG-TS for bitstream-level concat.
pub fn build_to_mpegts(ffmpeg: &str, input: &Path, video: VideoCodec, output: &Path) -> CommandSpec {
    let mut spec = base(ffmpeg).arg("-i").path_arg(input).args(["-c", "copy"]);
    match video {
        VideoCodec::Avc => spec = spec.args(["-bsf:v", "h264_mp4toannexb"]),
        VideoCodec::Hevc => spec = spec.args(["-bsf:v", "hevc_mp4toannexb"]),
        _ => {}
    }
    spec.args(["-f", "mpegts"]).path_arg(output)
}

/// Join MPEG-TS parts with the concat protocol.
pub fn build_concat_protocol(ffmpeg: &str, ts_parts: &[PathBuf], output: &Path) -> CommandSpec {
    let joined = ts_parts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("|");
    let spec = base(ffmpeg)
        .args(["-i", format!("concat:{}", joined).as_str()])
        .args(["-c", "copy", "-bsf:a", "aac_adtstoasc"]);
    with_faststart(spec, output).path_arg(output)
}

/// Filter graph cutting `ranges` out of input 0 and concatenating them.
pub fn trim_concat_graph(ranges: &[Interval], has_audio: bool) -> String {
    let mut graph = String::new();
    let mut inputs = String::new();
    for (i, r) in ranges.iter().enumerate() {
        graph.push_str(&format!(
            "[0:v]trim=start={}:end={},setpts=PTS-STARTPTS[v{i}];",
            secs(r.start),
            secs(r.end)
        ));
        inputs.push_str(&format!("[v{i}]"));
        if has_audio {
            graph.push_str(&format!(
                "[0:a]atrim=start={}:end={},asetpts=PTS-STARTPTS[a{i}];",
                secs(r.start),
                secs(r.end)
            ));
            inputs.push_str(&format!("[a{i}]"));
        }
    }
    let audio_out = if has_audio { "[outa]" } else { "" };
    graph.push_str(&format!(
        "{inputs}concat=n={}:v=1:a={}[outv]{audio_out}",
        ranges.len(),
        u8::from(has_audio)
    ));
    graph
}

/// Last-resort re-encode of the keep-ranges in one pass.
pub fn build_filter_trim(
    ffmpeg: &str,
    input: &Path,
    ranges: &[Interval],
    has_audio: bool,
    output: &Path,
) -> CommandSpec {
    let graph = trim_concat_graph(ranges, has_audio);
    let mut spec = base(ffmpeg)
        .arg("-i")
        .path_arg(input)
        .args(["-filter_complex", graph.as_str(), "-map", "[outv]"]);
    if has_audio {
        spec = spec.args(["-map", "[outa]"]);
    }
    spec = spec.args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]);
    if has_audio {
        spec = spec.args(audio_codec_args(AudioTarget::Aac));
    }
    with_faststart(spec, output).path_arg(output)
}

/// Run an ffmpeg command, classifying failures from its stderr tail.
pub async fn run_ffmpeg(
    runner: &dyn ProcessRunner,
    spec: &CommandSpec,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    runner.run(spec, None, cancel).await?;
    Ok(())
}
