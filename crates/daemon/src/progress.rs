//! Progress parsing for extractor output.
//!
//! The extractor prints human-readable progress lines. They are parsed into
//! [`ProgressEvent`]s and fed to a [`ProgressTracker`], which turns them into
//! status texts no more often than the status interval and emits a heartbeat
//! when the output has gone quiet.

use crate::jobs::JobStage;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

/// A recognised progress line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Download {
        percent: f32,
        total: Option<String>,
        speed: Option<String>,
        eta: Option<String>,
    },
    Merging,
    Converting(String),
}

impl ProgressEvent {
    pub fn stage(&self) -> JobStage {
        match self {
            ProgressEvent::Download { .. } => JobStage::Downloading,
            ProgressEvent::Merging => JobStage::Merging,
            ProgressEvent::Converting(_) => JobStage::Converting,
        }
    }

    pub fn percent(&self) -> Option<f32> {
        match self {
            ProgressEvent::Download { percent, .. } => Some(*percent),
            _ => None,
        }
    }

    pub fn status_text(&self) -> String {
        match self {
            ProgressEvent::Download {
                percent,
                total,
                speed,
                eta,
            } => {
                let mut text = format!("Downloading: {:.1}%", percent);
                if let Some(total) = total {
                    text.push_str(&format!(" of {}", total));
                }
                if let Some(speed) = speed {
                    text.push_str(&format!(" at {}", speed));
                }
                if let Some(eta) = eta {
                    text.push_str(&format!(", ETA {}", eta));
                }
                text
            }
            ProgressEvent::Merging => "Merging audio and video...".to_string(),
            ProgressEvent::Converting(step) => format!("Converting ({})...", step),
        }
    }
}

struct Patterns {
    download: Regex,
    merger: Regex,
    convert: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        download: Regex::new(
            r"^\[download\]\s+(?P<pct>\d{1,3}(?:\.\d+)?)%(?:\s+of\s+~?\s*(?P<total>\S+))?(?:\s+at\s+(?P<speed>\S+))?(?:\s+ETA\s+(?P<eta>\S+))?",
        )
        .expect("valid regex"),
        merger: Regex::new(r"^\[Merger\]").expect("valid regex"),
        convert: Regex::new(
            r"^\[(?P<step>ExtractAudio|VideoConvertor|VideoRemuxer|ffmpeg|Fixup\w+)\]",
        )
        .expect("valid regex"),
    })
}

/// Parse one line of extractor output.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();
    let p = patterns();

    if let Some(caps) = p.download.captures(line) {
        let percent: f32 = caps.name("pct")?.as_str().parse().ok()?;
        let field = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().to_string())
                .filter(|v| v != "Unknown" && v != "N/A")
        };
        return Some(ProgressEvent::Download {
            percent: percent.clamp(0.0, 100.0),
            total: field("total"),
            speed: field("speed"),
            eta: field("eta"),
        });
    }
    if p.merger.is_match(line) {
        return Some(ProgressEvent::Merging);
    }
    if let Some(caps) = p.convert.captures(line) {
        let step = caps.name("step").map(|m| m.as_str()).unwrap_or("ffmpeg");
        return Some(ProgressEvent::Converting(step.to_string()));
    }
    None
}

/// Throttles progress into status updates.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    interval: Duration,
    heartbeat: Duration,
    last_emit: Option<Instant>,
    last_activity: Instant,
    last_heartbeat: Option<Instant>,
    pending: Option<String>,
    last_sent: Option<String>,
    stage: JobStage,
    percent: Option<f32>,
}

impl ProgressTracker {
    pub fn new(interval: Duration, heartbeat: Duration, now: Instant) -> Self {
        Self {
            interval,
            heartbeat,
            last_emit: None,
            last_activity: now,
            last_heartbeat: None,
            pending: None,
            last_sent: None,
            stage: JobStage::Downloading,
            percent: None,
        }
    }

    /// Start over for a new attempt.
    pub fn reset(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_heartbeat = None;
        self.pending = None;
        self.last_sent = None;
        self.stage = JobStage::Downloading;
        self.percent = None;
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn percent(&self) -> Option<f32> {
        self.percent
    }

    /// Record a parsed event; the text goes out on the next [`poll`](Self::poll).
    pub fn observe(&mut self, event: &ProgressEvent, now: Instant) {
        self.last_activity = now;
        self.last_heartbeat = None;
        self.stage = event.stage();
        self.percent = event.percent().or(match event {
            ProgressEvent::Download { .. } => None,
            _ => self.percent,
        });
        self.pending = Some(event.status_text());
    }

    /// Status text to send now, if any.
    ///
    /// Never returns more than one text per interval, never repeats the
    /// last text, and yields a heartbeat after `heartbeat` of silence.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }

        if let Some(text) = self.pending.take() {
            if self.last_sent.as_deref() != Some(text.as_str()) {
                self.last_emit = Some(now);
                self.last_sent = Some(text.clone());
                return Some(text);
            }
        }

        let quiet = now.duration_since(self.last_activity);
        let since_heartbeat = self
            .last_heartbeat
            .map(|h| now.duration_since(h))
            .unwrap_or(quiet);
        if quiet >= self.heartbeat && since_heartbeat >= self.heartbeat {
            self.last_emit = Some(now);
            self.last_heartbeat = Some(now);
            let text = format!("Still working ({}s without progress)...", quiet.as_secs());
            self.last_sent = Some(text.clone());
            return Some(text);
        }
        None
    }
}
