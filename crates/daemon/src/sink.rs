//! Delivery sink seam.
//!
//! The transport that shows progress and hands files to the user lives
//! outside the daemon. The pipeline talks to it through [`DeliverySink`].

use crate::classify::Container;
use crate::error::PipelineError;
use crate::jobs::{JobId, JobOutcome};
use crate::size_gate::SizedCandidate;
use crate::url_lock::UserId;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The transport refused the upload.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who a delivery is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryTarget {
    pub job_id: JobId,
    pub user_id: UserId,
}

/// How the transport should present a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Inline streamable video.
    Video,
    Audio,
    /// Generic file attachment; accepted for anything.
    Document,
}

impl DeliveryMode {
    /// Preferred mode for a finished file.
    pub fn for_container(container: Container) -> Self {
        if container.is_audio_only() {
            DeliveryMode::Audio
        } else if container.is_streamable() {
            DeliveryMode::Video
        } else {
            DeliveryMode::Document
        }
    }
}

/// Metadata shipped alongside a delivered file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryMeta {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub source_url: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Replace the job's status line. Best effort.
    async fn update_status(&self, target: DeliveryTarget, text: &str);

    async fn deliver(
        &self,
        target: DeliveryTarget,
        file: &Path,
        meta: &DeliveryMeta,
        mode: DeliveryMode,
    ) -> Result<(), SinkError>;

    async fn deliver_photos(&self, target: DeliveryTarget, urls: &[String]) -> Result<(), SinkError>;

    /// Offer smaller formats after an explicit selection turned out oversize.
    async fn offer_alternatives(
        &self,
        target: DeliveryTarget,
        url: &str,
        candidates: &[SizedCandidate],
    ) -> Result<(), SinkError>;

    /// Final word on a job. `error` is `None` for success and cancellation.
    async fn job_finished(
        &self,
        target: DeliveryTarget,
        outcome: JobOutcome,
        error: Option<&PipelineError>,
    );
}

/// Deliver in `mode`, retrying as a document if the typed delivery fails.
pub async fn deliver_with_fallback(
    sink: &dyn DeliverySink,
    target: DeliveryTarget,
    file: &Path,
    meta: &DeliveryMeta,
    mode: DeliveryMode,
) -> Result<DeliveryMode, SinkError> {
    match sink.deliver(target, file, meta, mode).await {
        Ok(()) => Ok(mode),
        Err(e) if mode != DeliveryMode::Document => {
            warn!(job_id = %target.job_id, ?mode, error = %e, "typed delivery failed, sending as document");
            sink.deliver(target, file, meta, DeliveryMode::Document).await?;
            Ok(DeliveryMode::Document)
        }
        Err(e) => Err(e),
    }
}

/// Sink that copies deliveries into a local directory and logs the rest.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    out_dir: PathBuf,
}

impl LocalDirSink {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

#[async_trait]
impl DeliverySink for LocalDirSink {
    async fn update_status(&self, target: DeliveryTarget, text: &str) {
        info!(job_id = %target.job_id, user_id = target.user_id, status = text, "status");
    }

    async fn deliver(
        &self,
        target: DeliveryTarget,
        file: &Path,
        meta: &DeliveryMeta,
        mode: DeliveryMode,
    ) -> Result<(), SinkError> {
        let name = file
            .file_name()
            .ok_or_else(|| SinkError::Rejected(format!("not a file: {}", file.display())))?;
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let dest = self.out_dir.join(name);
        tokio::fs::copy(file, &dest).await?;
        info!(
            job_id = %target.job_id,
            ?mode,
            title = ?meta.title,
            bytes = meta.size_bytes,
            path = %dest.display(),
            "delivered"
        );
        Ok(())
    }

    async fn deliver_photos(&self, target: DeliveryTarget, urls: &[String]) -> Result<(), SinkError> {
        for url in urls {
            info!(job_id = %target.job_id, url = %url, "photo");
        }
        Ok(())
    }

    async fn offer_alternatives(
        &self,
        target: DeliveryTarget,
        url: &str,
        candidates: &[SizedCandidate],
    ) -> Result<(), SinkError> {
        for c in candidates {
            info!(
                job_id = %target.job_id,
                url,
                format = %c.format_id,
                height = ?c.height,
                bytes = c.estimated_bytes,
                "alternative"
            );
        }
        Ok(())
    }

    async fn job_finished(
        &self,
        target: DeliveryTarget,
        outcome: JobOutcome,
        error: Option<&PipelineError>,
    ) {
        match error {
            Some(e) => warn!(job_id = %target.job_id, ?outcome, error = %e, "job failed"),
            None => debug!(job_id = %target.job_id, ?outcome, "job finished"),
        }
    }
}
