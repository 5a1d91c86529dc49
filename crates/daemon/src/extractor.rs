//! Extractor seam and its yt-dlp implementation.

use crate::attempts::AttemptArgs;
use crate::error::PipelineError;
use crate::formats::MediaInfo;
use crate::process::{CommandSpec, ProcessRunner};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output template inside the job workspace.
const OUTPUT_TEMPLATE: &str = "%(id).80s.%(ext)s";

/// One download request against the extractor.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub args: AttemptArgs,
    pub output_dir: PathBuf,
    /// Container to merge separate streams into.
    pub merge_format: Option<String>,
}

/// Resolves metadata and downloads media.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn resolve(
        &self,
        url: &str,
        args: &AttemptArgs,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, PipelineError>;

    /// Download into `request.output_dir`, forwarding output lines to `lines`.
    async fn download(
        &self,
        request: &DownloadRequest,
        lines: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

/// [`Extractor`] driving the yt-dlp command line.
pub struct YtDlpExtractor {
    runner: Arc<dyn ProcessRunner>,
    ytdlp_path: String,
    ffmpeg_path: String,
}

impl YtDlpExtractor {
    pub fn new(runner: Arc<dyn ProcessRunner>, ytdlp_path: &str, ffmpeg_path: &str) -> Self {
        Self {
            runner,
            ytdlp_path: ytdlp_path.to_string(),
            ffmpeg_path: ffmpeg_path.to_string(),
        }
    }

    fn common_args(&self, spec: CommandSpec, args: &AttemptArgs) -> CommandSpec {
        let mut spec = spec.args(["--no-playlist", "--no-warnings"]);
        if let Some(cookies) = &args.cookies {
            spec = spec.arg("--cookies").path_arg(cookies);
        }
        if let Some(proxy) = &args.proxy {
            spec = spec.args(["--proxy", proxy.as_str()]);
        }
        if args.force_generic {
            spec = spec.arg("--force-generic-extractor");
        }
        if let Some(referer) = &args.referer {
            spec = spec.args(["--referer", referer.as_str()]);
        }
        spec
    }

    /// Metadata query: `yt-dlp -J [-f selector] ... url`
    pub fn build_resolve_command(&self, url: &str, args: &AttemptArgs) -> CommandSpec {
        let mut spec = self.common_args(CommandSpec::new(&self.ytdlp_path).arg("-J"), args);
        if let Some(format) = &args.format {
            spec = spec.args(["-f", format.as_str()]);
        }
        spec.arg("--").arg(url)
    }

    /// Download into the workspace with line-per-update progress.
    pub fn build_download_command(&self, request: &DownloadRequest) -> CommandSpec {
        let args = &request.args;
        let mut spec = self.common_args(
            CommandSpec::new(&self.ytdlp_path).args(["--newline", "--no-mtime", "--no-part"]),
            args,
        );
        spec = spec.args(["--ffmpeg-location", self.ffmpeg_path.as_str()]);
        if let Some(format) = &args.format {
            spec = spec.args(["-f", format.as_str()]);
        }
        if let Some(merge) = &request.merge_format {
            spec = spec.args(["--merge-output-format", merge.as_str()]);
        }
        if args.hls_transport {
            spec = spec.args(["--downloader", "m3u8:ffmpeg", "--hls-use-mpegts"]);
        }
        spec.arg("-P")
            .path_arg(&request.output_dir)
            .args(["-o", OUTPUT_TEMPLATE])
            .arg("--")
            .arg(request.url.as_str())
            .current_dir(request.output_dir.clone())
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn resolve(
        &self,
        url: &str,
        args: &AttemptArgs,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, PipelineError> {
        let spec = self.build_resolve_command(url, args);
        let output = self.runner.run(&spec, None, cancel).await?;
        let info = MediaInfo::parse(output.stdout.trim()).map_err(|e| {
            PipelineError::fatal(format!("unreadable metadata from {}: {}", spec.tool_name(), e))
        })?;
        debug!(url, title = ?info.title, formats = info.formats.len(), "metadata resolved");
        Ok(info)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        lines: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let spec = self.build_download_command(request);
        self.runner.run(&spec, Some(lines), cancel).await?;
        Ok(())
    }
}
