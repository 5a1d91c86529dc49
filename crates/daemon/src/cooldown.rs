//! Shared per-host rate-limit cooldown
//!
//! When a provider signals throttling, every job talking to that host waits
//! until the host's cooldown deadline passes. Deadlines only move later.

use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct CooldownTracker {
    until: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn until(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.until.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push the host's deadline to at least `now + delay`
    ///
    /// A smaller delay than what is already pending leaves the deadline alone.
    /// Returns the effective deadline.
    pub fn extend(&self, host: &str, delay: Duration) -> Instant {
        let candidate = Instant::now() + delay;
        let mut until = self.until();
        let deadline = until
            .entry(host.to_string())
            .and_modify(|d| *d = (*d).max(candidate))
            .or_insert(candidate);
        info!(host, delay_secs = delay.as_secs(), "rate-limit cooldown extended");
        *deadline
    }

    /// Time left before `host` may be contacted again
    pub fn remaining(&self, host: &str) -> Duration {
        self.until()
            .get(host)
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Sleep until the host's cooldown has elapsed
    ///
    /// Re-checks after each sleep because another job may have extended the
    /// deadline meanwhile. Returns the total time waited.
    pub async fn wait(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration, PipelineError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled());
            }
            let remaining = self.remaining(host);
            if remaining.is_zero() {
                return Ok(started.elapsed());
            }
            debug!(host, wait_ms = remaining.as_millis() as u64, "waiting out cooldown");
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
            }
        }
    }

    /// Hosts currently cooling down and their remaining time
    pub fn active(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut hosts: Vec<(String, Duration)> = self
            .until()
            .iter()
            .filter(|(_, d)| **d > now)
            .map(|(h, d)| (h.clone(), d.saturating_duration_since(now)))
            .collect();
        hosts.sort();
        hosts
    }
}
