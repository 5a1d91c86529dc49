//! Site resolvers: the pipeline's first stage.
//!
//! A resolver may swap the submitted URL for a better one or short-circuit
//! to photo delivery. Resolver failures are never fatal; the pipeline falls
//! through to the extractor with the original URL.

use crate::direct::BROWSER_USER_AGENT;
use crate::error::{ErrorKind, PipelineError};
use crate::url_lock::{host_matches, host_of};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// What a resolver turned a URL into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Download this URL instead.
    Video(String),
    /// Deliver these images; no download needed.
    Photos(Vec<String>),
}

#[async_trait]
pub trait SiteResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this resolver wants `url`.
    fn handles(&self, url: &str) -> bool;

    async fn resolve(&self, url: &str, cancel: &CancellationToken)
        -> Result<Resolution, PipelineError>;
}

/// Ordered set of resolvers; the first one that handles a URL wins.
#[derive(Clone, Default)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn SiteResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: Arc<dyn SiteResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Rewrite `url` if a resolver handles it.
    ///
    /// Returns `Ok(None)` when nothing applies or the resolver failed; only
    /// cancellation is propagated.
    pub async fn rewrite(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Resolution>, PipelineError> {
        let Some(resolver) = self.resolvers.iter().find(|r| r.handles(url)) else {
            return Ok(None);
        };
        match resolver.resolve(url, cancel).await {
            Ok(resolution) => {
                info!(resolver = resolver.name(), url, "url rewritten by site resolver");
                Ok(Some(resolution))
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(resolver = resolver.name(), url, error = %e, "site resolver failed, falling through");
                Ok(None)
            }
        }
    }
}

struct PagePatterns {
    candidates: Vec<Regex>,
    quality: Regex,
}

fn page_patterns() -> &'static PagePatterns {
    static PATTERNS: OnceLock<PagePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PagePatterns {
        candidates: [
            r#"(?i)<meta[^>]+property="og:video(?::secure_url)?"[^>]+content="([^"]+)""#,
            r#"(?i)<meta[^>]+name="twitter:player:stream"[^>]+content="([^"]+)""#,
            r#"(?i)<source[^>]+src="([^"]+)""#,
            r#"(?i)<video[^>]+src="([^"]+)""#,
            r#"(?i)"(?:videoUrl|video_url|playback_url|stream_url|hlsUrl|hls_url|dash_url)"\s*:\s*"([^"]+)""#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect(),
        quality: Regex::new(r"(\d{3,4})p").expect("valid regex"),
    })
}

/// Ad, tracking and subtitle links never worth downloading.
const REJECTED_TOKENS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "google-analytics.com",
    "adservice.",
    "/ads/",
    ".vtt",
    ".srt",
];

fn normalize_candidate(raw: &str, base: &Url) -> Option<String> {
    let value = raw
        .replace("\\/", "/")
        .replace("\\u0026", "&")
        .replace("\\u003D", "=")
        .replace("&amp;", "&");
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let resolved = base.join(value).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    let resolved = resolved.to_string();
    let lowered = resolved.to_ascii_lowercase();
    if REJECTED_TOKENS.iter().any(|t| lowered.contains(t)) {
        return None;
    }
    Some(resolved)
}

/// Media links embedded in `page`, in discovery order, deduplicated.
pub fn collect_media_candidates(page: &str, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for pattern in &page_patterns().candidates {
        for caps in pattern.captures_iter(page) {
            let Some(raw) = caps.get(1) else { continue };
            if let Some(candidate) = normalize_candidate(raw.as_str(), base) {
                if seen.insert(candidate.clone()) {
                    out.push(candidate);
                }
            }
        }
    }
    out
}

/// Best candidate: media-like, then same host, then highest `NNNp`.
pub fn pick_best_candidate(candidates: &[String], source: &Url) -> Option<String> {
    let source_host = source.host_str().unwrap_or_default().to_ascii_lowercase();
    candidates
        .iter()
        .max_by_key(|c| {
            let lowered = c.to_ascii_lowercase();
            let media_like = [".mp4", ".m3u8", ".mpd", ".webm", ".mov"]
                .iter()
                .any(|ext| lowered.contains(ext));
            let same_host = host_of(c)
                .map(|h| host_matches(&h, &source_host))
                .unwrap_or(false);
            let quality: u32 = page_patterns()
                .quality
                .captures(&lowered)
                .and_then(|m| m.get(1)?.as_str().parse().ok())
                .unwrap_or(0);
            (media_like, same_host, quality)
        })
        .cloned()
}

/// Scrapes a page for an embedded media link on configured hosts.
pub struct PageMediaResolver {
    client: Client,
    hosts: Vec<String>,
}

impl PageMediaResolver {
    pub fn new(hosts: Vec<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .map_err(|e| PipelineError::fatal(format!("http client: {}", e)))?;
        Ok(Self { client, hosts })
    }

    async fn fetch_page(&self, url: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| PipelineError::new(ErrorKind::TransientNetwork, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fatal(format!("HTTP {}", status)));
        }
        response
            .text()
            .await
            .map_err(|e| PipelineError::new(ErrorKind::TransientNetwork, e.to_string()))
    }
}

#[async_trait]
impl SiteResolver for PageMediaResolver {
    fn name(&self) -> &'static str {
        "page_media"
    }

    fn handles(&self, url: &str) -> bool {
        host_of(url)
            .map(|h| self.hosts.iter().any(|d| host_matches(&h, d)))
            .unwrap_or(false)
    }

    async fn resolve(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Resolution, PipelineError> {
        let base = Url::parse(url).map_err(|e| PipelineError::fatal(e.to_string()))?;
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
            page = self.fetch_page(url) => page?,
        };
        if page.contains("cf-mitigated") || page.contains("Just a moment...") {
            return Err(PipelineError::new(ErrorKind::AuthRequired, "challenge page"));
        }
        let candidates = collect_media_candidates(&page, &base);
        debug!(url, candidates = candidates.len(), "page scanned");
        pick_best_candidate(&candidates, &base)
            .map(Resolution::Video)
            .ok_or_else(|| PipelineError::fatal("no media link on page"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html><head>
        <meta property="og:video" content="https://cdn.example.com/v/clip_480p.mp4">
        <meta property="og:video:secure_url" content="https://cdn.example.com/v/clip_720p.mp4">
        </head><body>
        <video src="/media/clip_1080p.mp4"></video>
        <script src="https://googlesyndication.com/ads/x.mp4"></script>
        <script>{"hls_url":"https:\/\/example.com\/live\/master.m3u8?a=1&b=2"}</script>
        </body></html>"#;

    #[test]
    fn test_collect_candidates() {
        let base = Url::parse("https://example.com/post/9").unwrap();
        let candidates = collect_media_candidates(PAGE, &base);
        assert_eq!(
            candidates,
            vec![
                "https://cdn.example.com/v/clip_480p.mp4",
                "https://cdn.example.com/v/clip_720p.mp4",
                "https://example.com/media/clip_1080p.mp4",
                "https://example.com/live/master.m3u8?a=1&b=2",
            ]
        );
    }

    #[test]
    fn test_pick_best_prefers_same_host_then_quality() {
        let base = Url::parse("https://example.com/post/9").unwrap();
        let candidates = collect_media_candidates(PAGE, &base);
        assert_eq!(
            pick_best_candidate(&candidates, &base).as_deref(),
            Some("https://example.com/media/clip_1080p.mp4")
        );
        assert_eq!(pick_best_candidate(&[], &base), None);
    }

    struct Failing;

    #[async_trait]
    impl SiteResolver for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn handles(&self, url: &str) -> bool {
            url.contains("special")
        }
        async fn resolve(
            &self,
            _url: &str,
            _cancel: &CancellationToken,
        ) -> Result<Resolution, PipelineError> {
            Err(PipelineError::fatal("scraper broke"))
        }
    }

    #[tokio::test]
    async fn test_chain_falls_through_on_failure() {
        let chain = ResolverChain::new().with(Arc::new(Failing));
        let cancel = CancellationToken::new();
        assert_eq!(chain.rewrite("https://special.example/x", &cancel).await.unwrap(), None);
        assert_eq!(chain.rewrite("https://other.example/x", &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_page_resolver_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/watch/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<meta property="og:video" content="/files/movie_720p.mp4">"#,
            ))
            .mount(&server)
            .await;

        let resolver = PageMediaResolver::new(vec!["127.0.0.1".to_string()]).unwrap();
        let url = format!("{}/watch/1", server.uri());
        assert!(resolver.handles(&url));
        let chain = ResolverChain::new().with(Arc::new(resolver));
        let resolution = chain.rewrite(&url, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            resolution,
            Some(Resolution::Video(format!("{}/files/movie_720p.mp4", server.uri())))
        );
    }
}
