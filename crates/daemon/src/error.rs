//! Error taxonomy shared by every pipeline stage.
//!
//! Each fallible stage reports a [`PipelineError`] carrying one closed
//! [`ErrorKind`]. The kind drives the retry decision in the attempt cascade;
//! the payload carries the diagnostic tail from the external tool and an
//! optional suggested wait.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Closed classification of pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection resets, timeouts, 5xx. Bounded retry with backoff.
    TransientNetwork,
    /// The requested format is not offered. Retry with another format.
    FormatUnavailable,
    /// The provider throttled us. Retry after the host cooldown.
    RateLimited,
    /// Credentials rejected or required. Retry once without them.
    AuthRequired,
    /// Result would exceed the delivery ceiling. Never retried.
    Oversize,
    /// Cooperative cancellation. Unwinds silently.
    Cancelled,
    /// No extractor handles the URL. Never retried.
    Unsupported,
    /// Every fallback exhausted.
    Fatal,
}

impl ErrorKind {
    /// Whether any cascade tier may try again after this kind.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Oversize | ErrorKind::Cancelled | ErrorKind::Unsupported
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::FormatUnavailable => "format_unavailable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::Oversize => "oversize",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    /// How long the caller should wait before trying again, if known.
    pub suggested_wait: Option<Duration>,
    /// Last lines of the failing tool's diagnostics.
    pub diagnostic_tail: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggested_wait: None,
            diagnostic_tail: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "job cancelled")
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn oversize(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Oversize, message)
    }

    /// Build an error from a tool's diagnostic output, classifying it.
    pub fn from_tool_output(tool: &str, tail: &str) -> Self {
        let kind = classify_tool_output(tail);
        let headline = tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("ERROR") || l.contains("Error"))
            .or_else(|| tail.lines().rev().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or("no diagnostic output")
            .to_string();
        Self {
            kind,
            message: format!("{} failed: {}", tool, headline),
            suggested_wait: None,
            diagnostic_tail: Some(tail.to_string()),
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.suggested_wait = Some(wait);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::fatal(format!("I/O error: {}", e))
    }
}

struct Patterns {
    rate_limited: Regex,
    format_unavailable: Regex,
    auth_required: Regex,
    unsupported: Regex,
    transient: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        rate_limited: Regex::new(
            r"(?i)(http error 429|too many requests|rate[- ]?limit|please wait a few minutes|try again later)",
        )
        .expect("valid regex"),
        format_unavailable: Regex::new(
            r"(?i)(requested format (is )?not available|no video formats found|format not available)",
        )
        .expect("valid regex"),
        auth_required: Regex::new(
            r"(?i)(sign in to confirm|login required|log in to|http error 40[13]|private video|cookies? (are|is) (no longer )?(valid|invalid)|authentication)",
        )
        .expect("valid regex"),
        unsupported: Regex::new(r"(?i)unsupported url").expect("valid regex"),
        transient: Regex::new(
            r"(?i)(timed? ?out|connection (reset|refused|aborted)|temporary failure|network is unreachable|http error 5\d\d|remote end closed|incompleteread|ssl: |eof occurred)",
        )
        .expect("valid regex"),
    })
}

/// Classify free-text diagnostics from the extractor or transcoder.
///
/// Order matters: a 429 line usually also mentions "try again", and a
/// cookie rejection often arrives as HTTP 403.
pub fn classify_tool_output(text: &str) -> ErrorKind {
    let p = patterns();
    if p.rate_limited.is_match(text) {
        ErrorKind::RateLimited
    } else if p.format_unavailable.is_match(text) {
        ErrorKind::FormatUnavailable
    } else if p.unsupported.is_match(text) {
        ErrorKind::Unsupported
    } else if p.auth_required.is_match(text) {
        ErrorKind::AuthRequired
    } else if p.transient.is_match(text) {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::Fatal
    }
}
