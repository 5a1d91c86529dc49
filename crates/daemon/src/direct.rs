//! Direct HTTP fetch for links that point straight at a media file.
//!
//! Such links skip the extractor entirely. Any failure here is reported to
//! the pipeline, which then falls through to the extractor path.

use crate::error::{ErrorKind, PipelineError};
use reqwest::header::{ACCEPT, REFERER};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Browser user agent; several CDNs refuse library defaults.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Bodies smaller than this are error pages, not media.
pub const MIN_VALID_BYTES: u64 = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(180);

/// Extensions treated as direct media links.
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "webm", "mkv", "mp3", "m4a", "ogg", "opus", "wav", "flac", "gif",
];

/// Media extension of `url`'s path, if it names a media file.
pub fn direct_media_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let last = parsed.path_segments()?.last()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    MEDIA_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Downloads direct media links into a job workspace.
pub struct DirectFetcher {
    client: Client,
}

impl DirectFetcher {
    pub fn new(proxy: Option<&str>) -> Result<Self, PipelineError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .user_agent(BROWSER_USER_AGENT);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PipelineError::fatal(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| PipelineError::fatal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Fetch `url` into `dir`, returning the written file.
    pub async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let ext = direct_media_extension(url)
            .ok_or_else(|| PipelineError::new(ErrorKind::Unsupported, "not a direct media link"))?;
        let dest = dir.join(format!("direct.{}", ext));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::cancelled()),
            r = self.fetch_to(url, referer, &dest) => r,
        };
        match result {
            Ok(bytes) if bytes >= MIN_VALID_BYTES => {
                info!(url, bytes, "direct fetch complete");
                Ok(dest)
            }
            Ok(bytes) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(PipelineError::fatal(format!(
                    "downloaded file is too small ({} bytes)",
                    bytes
                )))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e)
            }
        }
    }

    async fn fetch_to(
        &self,
        url: &str,
        referer: Option<&str>,
        dest: &Path,
    ) -> Result<u64, PipelineError> {
        let mut request = self.client.get(url).header(ACCEPT, "*/*");
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let mut response = request.send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        debug!(url, content_length = ?response.content_length(), "direct fetch started");

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

fn request_error(e: reqwest::Error) -> PipelineError {
    let kind = if e.is_timeout() || e.is_connect() || e.is_body() {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::Fatal
    };
    PipelineError::new(kind, format!("direct fetch failed: {}", e))
}

fn status_error(status: StatusCode) -> PipelineError {
    let kind = match status.as_u16() {
        401 | 403 | 407 => ErrorKind::AuthRequired,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::TransientNetwork,
        _ => ErrorKind::Fatal,
    };
    PipelineError::new(kind, format!("HTTP {}", status))
}
