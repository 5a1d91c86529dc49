//! Startup checks for the media fetch daemon
//!
//! Preflight checks run before the daemon accepts work:
//! - yt-dlp availability
//! - FFmpeg version check (requires 4.0+)
//! - ffprobe availability

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest FFmpeg major version whose concat and bitstream filters we rely on
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("yt-dlp not available: {0}")]
    YtDlpUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// Versions reported by the external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub ytdlp: String,
    pub ffmpeg_major: u32,
}

/// Run `program` with one flag and return its stdout if it exits cleanly.
fn tool_output(program: &str, flag: &str) -> Result<String, String> {
    let output = Command::new(program)
        .arg(flag)
        .output()
        .map_err(|e| format!("{} {} failed; is it installed and in PATH? Error: {}", program, flag, e))?;
    if !output.status.success() {
        return Err(format!("{} {} exited with {}", program, flag, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that yt-dlp runs, returning its version string
pub fn check_ytdlp_available(ytdlp: &str) -> Result<String, StartupError> {
    let out = tool_output(ytdlp, "--version").map_err(StartupError::YtDlpUnavailable)?;
    let version = out.lines().next().unwrap_or_default().trim().to_string();
    if version.is_empty() {
        return Err(StartupError::YtDlpUnavailable(format!(
            "{} --version printed nothing",
            ytdlp
        )));
    }
    Ok(version)
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // major is everything before the first '.' or '-'
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that FFmpeg is at least [`MIN_FFMPEG_MAJOR`], returning its major version
pub fn check_ffmpeg_version(ffmpeg: &str) -> Result<u32, StartupError> {
    let version_output = tool_output(ffmpeg, "-version").map_err(StartupError::FfmpegVersion)?;
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(major_version)
}

pub fn check_ffprobe_available(ffprobe: &str) -> Result<(), StartupError> {
    tool_output(ffprobe, "-version")
        .map(|_| ())
        .map_err(StartupError::FfprobeUnavailable)
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. yt-dlp availability
/// 2. FFmpeg version
/// 3. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<ToolVersions, StartupError> {
    let ytdlp = check_ytdlp_available(&cfg.tools.ytdlp_path)?;
    let ffmpeg_major = check_ffmpeg_version(&cfg.tools.ffmpeg_path)?;
    check_ffprobe_available(&cfg.tools.ffprobe_path)?;
    info!(ytdlp = %ytdlp, ffmpeg_major, "startup checks passed");
    Ok(ToolVersions {
        ytdlp,
        ffmpeg_major,
    })
}
