//! Job registry for pending and active download jobs.
//!
//! The registry is the in-memory source of truth for which jobs exist, who
//! owns them, and how to cancel them. Nothing is persisted; a restart starts
//! from an empty registry.

use crate::error::ErrorKind;
use crate::url_lock::{LockId, UrlLockManager, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Unique job identifier.
pub type JobId = Uuid;

/// Scheduling state of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue.
    Pending,
    /// Dequeued and running.
    Active,
}

/// Stage of a job in the download pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Job is waiting in queue.
    #[default]
    Queued,
    /// Metadata is being resolved.
    Resolving,
    /// The extractor is downloading.
    Downloading,
    /// Separate streams are being merged.
    Merging,
    /// The output is being converted or re-encoded.
    Converting,
    /// Sponsor segments are being cut out.
    Trimming,
    /// The file is being handed to the delivery sink.
    Delivering,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Queued => write!(f, "queued"),
            JobStage::Resolving => write!(f, "resolving"),
            JobStage::Downloading => write!(f, "downloading"),
            JobStage::Merging => write!(f, "merging"),
            JobStage::Converting => write!(f, "converting"),
            JobStage::Trimming => write!(f, "trimming"),
            JobStage::Delivering => write!(f, "delivering"),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(ErrorKind),
    Cancelled,
}

/// A registered job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub user_id: UserId,
    /// URL as submitted.
    pub url: String,
    pub normalized_url: String,
    pub lock_id: LockId,
    pub state: JobState,
    pub stage: JobStage,
    /// Percent complete of the current stage, when known.
    pub progress: Option<f32>,
    /// Unix timestamp (milliseconds) when the job was registered.
    pub created_at: i64,
    pub cancel: CancellationToken,
}

/// Serializable projection of a [`JobRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub id: JobId,
    pub user_id: UserId,
    pub url: String,
    pub state: JobState,
    pub stage: JobStage,
    pub progress: Option<f32>,
    pub created_at: i64,
}

impl From<&JobRecord> for JobView {
    fn from(r: &JobRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            url: r.normalized_url.clone(),
            state: r.state,
            stage: r.stage,
            progress: r.progress,
            created_at: r.created_at,
        }
    }
}

/// Error type for registry operations
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Registry is at capacity ({0} jobs)")]
    Full(usize),
}

/// Totals of finished jobs since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Pending and active jobs with their cancellation handles.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    max_global_tasks: usize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl JobRegistry {
    pub fn new(max_global_tasks: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_global_tasks,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.max_global_tasks
    }

    /// Record a new pending job and hand back its cancellation token.
    pub fn register(
        &self,
        user_id: UserId,
        url: &str,
        normalized_url: &str,
        lock_id: LockId,
    ) -> Result<JobRecord, RegistryError> {
        let mut jobs = self.jobs();
        if jobs.len() >= self.max_global_tasks {
            return Err(RegistryError::Full(self.max_global_tasks));
        }
        let record = JobRecord {
            id: Uuid::new_v4(),
            user_id,
            url: url.to_string(),
            normalized_url: normalized_url.to_string(),
            lock_id,
            state: JobState::Pending,
            stage: JobStage::Queued,
            progress: None,
            created_at: current_timestamp_ms(),
            cancel: CancellationToken::new(),
        };
        jobs.insert(record.id, record.clone());
        debug!(job_id = %record.id, user_id, "job registered");
        Ok(record)
    }

    /// Flip a job to Active. Returns false if it is no longer registered.
    pub fn mark_active(&self, id: JobId) -> bool {
        match self.jobs().get_mut(&id) {
            Some(job) => {
                job.state = JobState::Active;
                true
            }
            None => false,
        }
    }

    pub fn set_stage(&self, id: JobId, stage: JobStage, progress: Option<f32>) {
        if let Some(job) = self.jobs().get_mut(&id) {
            job.stage = stage;
            job.progress = progress;
        }
    }

    pub fn remove(&self, id: JobId) -> Option<JobRecord> {
        self.jobs().remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs().get(&id).cloned()
    }

    /// Pending + active job count
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs().values().filter(|j| j.state == state).count()
    }

    pub fn user_jobs(&self, user_id: UserId, state: JobState) -> Vec<JobId> {
        self.jobs()
            .values()
            .filter(|j| j.user_id == user_id && j.state == state)
            .map(|j| j.id)
            .collect()
    }

    pub fn is_user_job(&self, id: JobId, user_id: UserId) -> bool {
        self.jobs().get(&id).map(|j| j.user_id == user_id).unwrap_or(false)
    }

    /// Trigger the cancellation handle of one job.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.jobs().get(&id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Views of every registered job, oldest first.
    pub fn views(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self.jobs().values().map(JobView::from).collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub fn record_outcome(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Succeeded => &self.completed,
            JobOutcome::Failed(_) => &self.failed,
            JobOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Releases a job's registry entry and URL lock exactly once.
///
/// Owned by the job's queued future, so the release runs whether the future
/// completes, fails, is cancelled, or is dropped from the queue unstarted.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    locks: Arc<UrlLockManager>,
    job_id: JobId,
    user_id: UserId,
    url: String,
    lock_id: LockId,
    released: bool,
}

impl JobGuard {
    pub fn new(registry: Arc<JobRegistry>, locks: Arc<UrlLockManager>, record: &JobRecord) -> Self {
        Self {
            registry,
            locks,
            job_id: record.id,
            user_id: record.user_id,
            url: record.url.clone(),
            lock_id: record.lock_id,
            released: false,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Deregister the job and drop its lock. Later calls are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.remove(self.job_id);
        self.locks.unlock(self.user_id, &self.url, Some(self.lock_id));
        debug!(job_id = %self.job_id, user_id = self.user_id, "job released");
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
