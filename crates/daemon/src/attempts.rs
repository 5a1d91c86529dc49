//! Fallback cascade for extractor invocations.
//!
//! Every extractor call is made with an [`AttemptArgs`]. When a call fails,
//! the error kind decides what happens next: rate limits wait out the shared
//! host cooldown with exponential backoff, transient network errors retry the
//! same arguments a bounded number of times, and everything else moves on to
//! the next applicable [`Fallback`] tier. Each tier is used at most once.

use crate::cooldown::CooldownTracker;
use crate::error::{ErrorKind, PipelineError};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Single format that every extractor understands.
const SINGLE_FORMAT: &str = "b";

/// Arguments varied between attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptArgs {
    /// Format selector; `None` lets the extractor choose.
    pub format: Option<String>,
    pub cookies: Option<PathBuf>,
    pub proxy: Option<String>,
    pub force_generic: bool,
    /// Download HLS through the transcoder instead of natively.
    pub hls_transport: bool,
    pub referer: Option<String>,
}

/// What the cascade knows about the current job.
#[derive(Debug, Clone, Default)]
pub struct CascadeContext {
    /// Proxy for the proxy tier; the tier is skipped without one.
    pub proxy: Option<String>,
    /// The host is known to work with the generic extractor.
    pub generic_allowed: bool,
    /// The media offers HLS formats.
    pub hls_available: bool,
}

/// A named fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Retry without an explicit format filter.
    DropFormat,
    /// Retry with one pre-muxed format.
    SingleFormat,
    /// Retry without cookies; some hosts reject cookie-bearing requests.
    WithoutCookies,
    /// Retry through the configured proxy.
    ViaProxy,
    /// Retry with the generic extractor.
    GenericExtractor,
    /// Retry with the alternative HLS transport.
    HlsTransport,
}

/// Tier order for metadata resolution.
pub const METADATA_CASCADE: &[Fallback] = &[
    Fallback::DropFormat,
    Fallback::WithoutCookies,
    Fallback::ViaProxy,
    Fallback::GenericExtractor,
];

/// Tier order for the download itself.
pub const DOWNLOAD_CASCADE: &[Fallback] = &[
    Fallback::HlsTransport,
    Fallback::SingleFormat,
    Fallback::WithoutCookies,
    Fallback::GenericExtractor,
    Fallback::ViaProxy,
];

impl Fallback {
    pub fn name(self) -> &'static str {
        match self {
            Fallback::DropFormat => "drop_format",
            Fallback::SingleFormat => "single_format",
            Fallback::WithoutCookies => "without_cookies",
            Fallback::ViaProxy => "via_proxy",
            Fallback::GenericExtractor => "generic_extractor",
            Fallback::HlsTransport => "hls_transport",
        }
    }

    /// Whether this tier is worth trying after a failure of `kind`.
    pub fn applies(self, kind: ErrorKind, args: &AttemptArgs, ctx: &CascadeContext) -> bool {
        match self {
            Fallback::DropFormat => kind == ErrorKind::FormatUnavailable && args.format.is_some(),
            Fallback::SingleFormat => {
                kind == ErrorKind::FormatUnavailable
                    && args.format.as_deref() != Some(SINGLE_FORMAT)
            }
            Fallback::WithoutCookies => kind == ErrorKind::AuthRequired && args.cookies.is_some(),
            Fallback::ViaProxy => ctx.proxy.is_some() && args.proxy.is_none(),
            Fallback::GenericExtractor => ctx.generic_allowed && !args.force_generic,
            Fallback::HlsTransport => {
                ctx.hls_available
                    && !args.hls_transport
                    && matches!(kind, ErrorKind::TransientNetwork | ErrorKind::Fatal)
            }
        }
    }

    /// Arguments for the next attempt.
    pub fn apply(self, mut args: AttemptArgs, ctx: &CascadeContext) -> AttemptArgs {
        match self {
            Fallback::DropFormat => args.format = None,
            Fallback::SingleFormat => args.format = Some(SINGLE_FORMAT.to_string()),
            Fallback::WithoutCookies => args.cookies = None,
            Fallback::ViaProxy => args.proxy = ctx.proxy.clone(),
            Fallback::GenericExtractor => args.force_generic = true,
            Fallback::HlsTransport => args.hls_transport = true,
        }
        args
    }
}

/// Backoff rules for a host known to rate-limit.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub host: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RateLimitPolicy {
    /// `base * 2^(attempt - 1)` for the 1-based rate-limited attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Retry bounds for one cascade run.
#[derive(Debug, Clone)]
pub struct CascadePolicy {
    /// Same-argument retries after a transient network error.
    pub transient_retries: u32,
    /// Linear backoff step between transient retries.
    pub transient_backoff: Duration,
    pub rate_limit: Option<RateLimitPolicy>,
}

impl Default for CascadePolicy {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            transient_backoff: Duration::from_secs(2),
            rate_limit: None,
        }
    }
}

/// Run `attempt` until it succeeds, a terminal error occurs, or every tier
/// is exhausted.
///
/// The closure receives the arguments for this attempt and its 1-based
/// number. The last error is returned when nothing is left to try.
pub async fn run_cascade<T, F, Fut>(
    initial: AttemptArgs,
    tiers: &[Fallback],
    ctx: &CascadeContext,
    policy: &CascadePolicy,
    cooldown: &CooldownTracker,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, PipelineError>
where
    F: FnMut(AttemptArgs, u32) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut args = initial;
    let mut used: Vec<Fallback> = Vec::new();
    let mut transient_used = 0u32;
    let mut rate_limited = 0u32;
    let mut number = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }
        if let Some(rl) = &policy.rate_limit {
            cooldown.wait(&rl.host, cancel).await?;
        }

        number += 1;
        debug!(attempt = number, args = ?args, "starting attempt");
        let err = match attempt(args.clone(), number).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if cancel.is_cancelled() || err.is_cancelled() {
            return Err(PipelineError::cancelled());
        }
        if !err.is_retryable() {
            return Err(err);
        }
        warn!(attempt = number, kind = %err.kind, error = %err.message, "attempt failed");

        match err.kind {
            ErrorKind::RateLimited => {
                if let Some(rl) = &policy.rate_limit {
                    rate_limited += 1;
                    let backoff = rl.delay_for(rate_limited);
                    let delay = err.suggested_wait.map_or(backoff, |w| w.max(backoff));
                    cooldown.extend(&rl.host, delay);
                    if rate_limited < rl.max_attempts {
                        continue;
                    }
                }
            }
            ErrorKind::TransientNetwork if transient_used < policy.transient_retries => {
                transient_used += 1;
                let delay = policy.transient_backoff.saturating_mul(transient_used);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
                }
                continue;
            }
            _ => {}
        }

        let next = tiers
            .iter()
            .copied()
            .find(|t| !used.contains(t) && t.applies(err.kind, &args, ctx));
        match next {
            Some(tier) => {
                info!(attempt = number, tier = tier.name(), "falling back");
                used.push(tier);
                args = tier.apply(args, ctx);
                // a new tier gets a fresh transient budget
                transient_used = 0;
            }
            None => return Err(err),
        }
    }
}
