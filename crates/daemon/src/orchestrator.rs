//! The orchestrator service: admission, queueing, cancellation and status.
//!
//! Owns the lock table, the job registry, the task queue and the selection
//! cache. Admission runs under one coarse gate so the capacity and lock
//! checks and the registration that follows them are a single step.

use crate::concurrency::ConcurrencyPlan;
use crate::error::PipelineError;
use crate::formats::{quality_menu, Quality};
use crate::jobs::{JobGuard, JobId, JobOutcome, JobRecord, JobRegistry, JobState, JobView, OutcomeCounts};
use crate::pipeline::{JobContext, JobRequest, Pipeline};
use crate::queue::{TaskError, TaskQueue};
use crate::request_cache::{RequestCache, RequestCacheEntry, SelectionMenu};
use crate::sink::DeliveryTarget;
use crate::url_lock::{normalize_url, BlockReason, LockId, LockOutcome, UrlLockManager, UserId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a submission or selection was refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Blocked(BlockReason),

    #[error("selection expired or unknown")]
    SelectionExpired,

    #[error("selection belongs to another user")]
    NotOwner,

    /// Metadata for the quality menu could not be resolved.
    #[error("could not resolve media: {0}")]
    Resolve(PipelineError),
}

impl SubmitError {
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            SubmitError::Blocked(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Result of [`Orchestrator::cancel_user_jobs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    /// Waiting jobs removed from the queue; their locks are already gone.
    pub removed_pending: usize,
    /// Running jobs whose cancellation handle was fired.
    pub cancel_requested_active: usize,
    /// Running jobs not yet torn down when this call returned.
    pub remaining_active: usize,
    /// Quality-menu resolutions interrupted; their reservations are released
    /// as they unwind.
    pub cancelled_selections: usize,
}

pub struct Orchestrator {
    locks: Arc<UrlLockManager>,
    registry: Arc<JobRegistry>,
    queue: TaskQueue<JobId>,
    pipeline: Arc<Pipeline>,
    selections: RequestCache,
    /// Menu resolutions in flight, keyed by their reserved lock.
    resolving: Mutex<HashMap<LockId, (UserId, CancellationToken)>>,
    admission: Mutex<()>,
}

/// A reservation whose quality menu is still being resolved.
///
/// Unregisters the resolution when dropped and gives the lock back unless
/// the menu was stored.
struct MenuReservation<'a> {
    orchestrator: &'a Orchestrator,
    user_id: UserId,
    url: String,
    lock_id: LockId,
    cancel: CancellationToken,
    kept: bool,
}

impl Drop for MenuReservation<'_> {
    fn drop(&mut self) {
        self.orchestrator.resolving().remove(&self.lock_id);
        if !self.kept {
            self.orchestrator
                .locks
                .unlock(self.user_id, &self.url, Some(self.lock_id));
        }
    }
}

impl Orchestrator {
    pub fn new(plan: ConcurrencyPlan, pipeline: Pipeline, selection_ttl: Duration) -> Self {
        Self {
            locks: Arc::new(UrlLockManager::new(plan.max_user_urls, plan.max_global_tasks)),
            registry: Arc::new(JobRegistry::new(plan.max_global_tasks)),
            queue: TaskQueue::new(plan.queue_concurrency),
            pipeline: Arc::new(pipeline),
            selections: RequestCache::new(selection_ttl),
            resolving: Mutex::new(HashMap::new()),
            admission: Mutex::new(()),
        }
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolving(&self) -> MutexGuard<'_, HashMap<LockId, (UserId, CancellationToken)>> {
        self.resolving.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn locks(&self) -> &UrlLockManager {
        &self.locks
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Admit `request` and queue it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<JobId, SubmitError> {
        self.admit(request, None)
    }

    fn admit(&self, request: JobRequest, reserved: Option<LockId>) -> Result<JobId, SubmitError> {
        let user_id = request.user_id;
        let _gate = self.gate();

        // a reservation only counts while it still holds the key
        let reserved = reserved.filter(|id| {
            self.locks
                .get(user_id, &request.url)
                .map(|lock| lock.lock_id == *id)
                .unwrap_or(false)
        });

        if let Some(reason) =
            self.locks
                .block_reason(user_id, &request.url, reserved, self.registry.len())
        {
            debug!(user_id, url = %request.url, %reason, "submission blocked");
            return Err(SubmitError::Blocked(reason));
        }

        let lock_id = match reserved {
            Some(id) => id,
            None => match self.locks.lock(user_id, &request.url) {
                LockOutcome::Acquired(id) => id,
                LockOutcome::AlreadyHeld(_) => {
                    return Err(SubmitError::Blocked(BlockReason::AlreadyInProgress))
                }
            },
        };

        let normalized = normalize_url(&request.url);
        let record = match self
            .registry
            .register(user_id, &request.url, &normalized, lock_id)
        {
            Ok(record) => record,
            Err(e) => {
                warn!(user_id, error = %e, "registry refused job");
                self.locks.unlock(user_id, &request.url, Some(lock_id));
                return Err(SubmitError::Blocked(BlockReason::ServerBusy));
            }
        };

        let guard = JobGuard::new(self.registry.clone(), self.locks.clone(), &record);
        let job_id = record.id;
        self.queue.add(
            job_id,
            run_job(
                guard,
                record,
                request,
                self.pipeline.clone(),
                self.registry.clone(),
                self.locks.clone(),
            ),
        );
        info!(%job_id, user_id, url = %normalized, "job queued");
        Ok(job_id)
    }

    /// Reserve the URL and resolve a quality menu for it.
    ///
    /// The reservation is held until the menu is confirmed or swept. The
    /// resolution itself is interrupted by [`Self::cancel_user_jobs`] and
    /// [`Self::cancel_all`], and the reservation is released if it fails.
    pub async fn prepare_selection(
        &self,
        user_id: UserId,
        url: &str,
        source_url: Option<String>,
    ) -> Result<SelectionMenu, SubmitError> {
        let mut reservation = {
            let _gate = self.gate();
            if let Some(reason) = self
                .locks
                .block_reason(user_id, url, None, self.registry.len())
            {
                return Err(SubmitError::Blocked(reason));
            }
            let lock_id = match self.locks.lock(user_id, url) {
                LockOutcome::Acquired(id) => id,
                LockOutcome::AlreadyHeld(_) => {
                    return Err(SubmitError::Blocked(BlockReason::AlreadyInProgress))
                }
            };
            let cancel = CancellationToken::new();
            self.resolving().insert(lock_id, (user_id, cancel.clone()));
            MenuReservation {
                orchestrator: self,
                user_id,
                url: url.to_string(),
                lock_id,
                cancel,
                kept: false,
            }
        };
        let lock_id = reservation.lock_id;

        let info = self
            .pipeline
            .resolve_info(url, source_url.as_deref(), &reservation.cancel)
            .await
            .map_err(SubmitError::Resolve)?;

        let formats = info.entries();
        let options = quality_menu(&formats);
        let title = info.title.clone();
        let key = self.selections.insert(RequestCacheEntry {
            user_id,
            url: url.to_string(),
            source_url,
            title: title.clone(),
            duration_secs: info.duration,
            formats,
            menu: options.clone(),
            chosen: None,
            lock_id,
            external_audio: None,
            created_at: Instant::now(),
        });
        reservation.kept = true;
        debug!(user_id, url, %key, options = options.len(), "selection offered");
        Ok(SelectionMenu {
            key,
            title,
            options,
        })
    }

    /// Submit the job for a pending selection with the reserved lock.
    ///
    /// A refused submission leaves the selection in place.
    pub fn confirm_selection(
        &self,
        key: &str,
        user_id: UserId,
        quality: Quality,
    ) -> Result<JobId, SubmitError> {
        let mut entry = self
            .selections
            .take(key, Instant::now())
            .ok_or(SubmitError::SelectionExpired)?;
        if entry.user_id != user_id {
            self.selections.restore(key, entry);
            return Err(SubmitError::NotOwner);
        }

        let mut request = JobRequest::new(user_id, entry.url.clone());
        request.force_audio = quality == Quality::Audio;
        request.quality = quality.clone();
        request.source_url = entry.source_url.clone();
        request.external_audio = entry.external_audio.clone();

        match self.admit(request, Some(entry.lock_id)) {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                entry.chosen = Some(quality);
                self.selections.restore(key, entry);
                Err(e)
            }
        }
    }

    pub fn selection(&self, key: &str) -> Option<RequestCacheEntry> {
        self.selections.get(key)
    }

    /// Drop expired selections and release their reservations.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.selections.sweep_expired(Instant::now());
        for entry in &expired {
            self.locks
                .unlock(entry.user_id, &entry.url, Some(entry.lock_id));
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired selections swept");
        }
        expired.len()
    }

    /// Remove the user's waiting jobs and signal their running ones.
    pub fn cancel_user_jobs(&self, user_id: UserId) -> CancelSummary {
        let _gate = self.gate();

        let pending: HashSet<JobId> = self
            .registry
            .user_jobs(user_id, JobState::Pending)
            .into_iter()
            .collect();
        let removed = self.queue.remove(|id| pending.contains(id));
        let removed_pending = removed.len();
        // dropping the entries runs their guards
        drop(removed);
        for _ in 0..removed_pending {
            self.registry.record_outcome(JobOutcome::Cancelled);
        }

        // dequeued but not yet marked active
        let mut cancel_requested_active = 0;
        for id in self.registry.user_jobs(user_id, JobState::Pending) {
            if self.registry.cancel(id) {
                cancel_requested_active += 1;
            }
        }
        for id in self.registry.user_jobs(user_id, JobState::Active) {
            if self.registry.cancel(id) {
                cancel_requested_active += 1;
            }
        }

        let cancelled_selections = self
            .resolving()
            .values()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, cancel)| cancel.cancel())
            .count();

        let summary = CancelSummary {
            removed_pending,
            cancel_requested_active,
            remaining_active: self.registry.user_jobs(user_id, JobState::Active).len(),
            cancelled_selections,
        };
        info!(user_id, ?summary, "user jobs cancelled");
        summary
    }

    /// Cancel one job if it belongs to `user_id`.
    pub fn cancel_job(&self, user_id: UserId, job_id: JobId) -> bool {
        if !self.registry.is_user_job(job_id, user_id) {
            return false;
        }
        let removed = self.queue.remove(|id| *id == job_id);
        if !removed.is_empty() {
            drop(removed);
            self.registry.record_outcome(JobOutcome::Cancelled);
            return true;
        }
        self.registry.cancel(job_id)
    }

    /// Drop everything waiting and signal everything running.
    pub fn cancel_all(&self) {
        let _gate = self.gate();
        let removed = self.queue.clear();
        for _ in 0..removed {
            self.registry.record_outcome(JobOutcome::Cancelled);
        }
        for view in self.registry.views() {
            self.registry.cancel(view.id);
        }
        for (_, cancel) in self.resolving().values() {
            cancel.cancel();
        }
        info!(removed, "all jobs cancelled");
    }

    /// Resolve once no job is waiting or running.
    pub async fn idle(&self) {
        self.queue.idle().await;
    }

    pub fn jobs(&self) -> Vec<JobView> {
        self.registry.views()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.count(JobState::Pending)
    }

    pub fn active_count(&self) -> usize {
        self.registry.count(JobState::Active)
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        self.registry.outcome_counts()
    }

    pub fn pending_selections(&self) -> usize {
        self.selections.len()
    }
}

/// Body of a queued job. Owns the guard, so the job's registry entry and
/// lock are released however this future ends, including being dropped
/// unstarted.
async fn run_job(
    mut guard: JobGuard,
    record: JobRecord,
    request: JobRequest,
    pipeline: Arc<Pipeline>,
    registry: Arc<JobRegistry>,
    locks: Arc<UrlLockManager>,
) -> Result<(), TaskError> {
    let target = DeliveryTarget {
        job_id: record.id,
        user_id: record.user_id,
    };
    let sink = pipeline.deps().sink.clone();

    if record.cancel.is_cancelled() || !registry.mark_active(record.id) {
        guard.release();
        registry.record_outcome(JobOutcome::Cancelled);
        sink.job_finished(target, JobOutcome::Cancelled, None).await;
        return Ok(());
    }
    locks.activate(record.user_id, &record.url, record.lock_id);

    let ctx = JobContext::new(target, record.cancel.clone()).with_registry(registry.clone());
    let result = pipeline.run(&request, &ctx).await;
    let outcome = match &result {
        Ok(_) => JobOutcome::Succeeded,
        Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
        Err(e) => JobOutcome::Failed(e.kind),
    };

    guard.release();
    registry.record_outcome(outcome);
    match &result {
        Ok(output) => info!(job_id = %record.id, ?output, "job succeeded"),
        Err(e) if e.is_cancelled() => info!(job_id = %record.id, "job cancelled"),
        Err(e) => warn!(job_id = %record.id, kind = %e.kind, error = %e.message, "job failed"),
    }
    sink.job_finished(target, outcome, result.as_ref().err()).await;
    Ok(())
}
