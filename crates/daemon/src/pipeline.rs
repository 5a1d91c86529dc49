//! The download pipeline: the body of every job.
//!
//! Stages run in order: site rewrite, direct fetch or metadata resolution,
//! size check, container decision, download with the fallback cascade,
//! post-processing, finalization and delivery. Cancellation is checked at
//! every stage boundary and inside every external process. The job's
//! workspace is removed when [`Pipeline::run`] returns, whichever way it
//! returns.

use crate::attempts::{
    run_cascade, AttemptArgs, CascadeContext, CascadePolicy, RateLimitPolicy, DOWNLOAD_CASCADE,
    METADATA_CASCADE,
};
use crate::classify::{decide_container, AudioCodec, Container, VideoCodec};
use crate::config::Config;
use crate::cooldown::CooldownTracker;
use crate::direct::{direct_media_extension, DirectFetcher};
use crate::encode::ffmpeg::{
    build_audio_transcode, build_external_audio_mux, build_remux, run_ffmpeg, MixMode,
};
use crate::error::PipelineError;
use crate::extractor::{DownloadRequest, Extractor};
use crate::finalize::{find_downloaded_file, finalize_file, JobWorkspace};
use crate::formats::{build_selector, FormatEntry, MediaInfo, Quality};
use crate::jobs::{JobRegistry, JobStage};
use crate::probe::{probe_file, ProbeResult};
use crate::process::ProcessRunner;
use crate::progress::{parse_progress_line, ProgressTracker};
use crate::resolver::{Resolution, ResolverChain};
use crate::sink::{deliver_with_fallback, DeliveryMeta, DeliveryMode, DeliverySink, DeliveryTarget};
use crate::size_gate::{check_size_gate, SizeDecision, SizedCandidate};
use crate::sponsor::{plan_keep_ranges, CutMethod, Interval, SegmentProvider, SegmentTrimmer};
use crate::url_lock::{host_matches, host_of, UserId};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

/// How often throttled status texts are flushed to the sink.
const STATUS_TICK: Duration = Duration::from_millis(250);

const MIB: u64 = 1024 * 1024;

/// Pipeline knobs, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub temp_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub rate_limited_hosts: Vec<String>,
    pub generic_extractor_hosts: Vec<String>,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_attempts: u32,
    pub transient_retries: u32,
    pub transient_backoff: Duration,
    /// Delivery ceiling; files at or above it are never delivered.
    pub max_upload_bytes: u64,
    pub require_aac_audio: bool,
    pub status_interval: Duration,
    pub heartbeat: Duration,
    pub alternatives_limit: usize,
    pub sponsor_categories: Vec<String>,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.tools.ffmpeg_path.clone(),
            ffprobe_path: cfg.tools.ffprobe_path.clone(),
            temp_dir: cfg.storage.temp_dir.clone(),
            cookies_file: cfg.network.cookies_file.clone(),
            proxy: cfg.network.proxy.clone(),
            rate_limited_hosts: cfg.network.rate_limited_hosts.clone(),
            generic_extractor_hosts: cfg.network.generic_extractor_hosts.clone(),
            rate_limit_base_delay: Duration::from_secs(cfg.network.rate_limit_base_delay_secs),
            rate_limit_max_attempts: cfg.network.rate_limit_max_attempts.max(1),
            transient_retries: cfg.network.transient_retries,
            transient_backoff: CascadePolicy::default().transient_backoff,
            max_upload_bytes: cfg.delivery.max_upload_bytes,
            require_aac_audio: cfg.delivery.require_aac_audio,
            status_interval: Duration::from_millis(cfg.delivery.status_interval_ms),
            heartbeat: Duration::from_secs(cfg.delivery.heartbeat_secs),
            alternatives_limit: cfg.delivery.alternatives_limit,
            sponsor_categories: cfg.sponsor.categories.clone(),
        }
    }

    /// Backoff rules when `url` belongs to a rate-limited host.
    ///
    /// The policy is keyed by the configured domain so subdomains share one
    /// cooldown.
    pub fn rate_limit_for(&self, url: &str) -> Option<RateLimitPolicy> {
        let host = host_of(url)?;
        let domain = self
            .rate_limited_hosts
            .iter()
            .find(|d| host_matches(&host, d))?;
        Some(RateLimitPolicy {
            host: domain.clone(),
            base_delay: self.rate_limit_base_delay,
            max_attempts: self.rate_limit_max_attempts,
        })
    }

    pub fn generic_allowed(&self, url: &str) -> bool {
        host_of(url)
            .map(|h| self.generic_extractor_hosts.iter().any(|d| host_matches(&h, d)))
            .unwrap_or(false)
    }

    fn cascade_policy(&self, url: &str) -> CascadePolicy {
        CascadePolicy {
            transient_retries: self.transient_retries,
            transient_backoff: self.transient_backoff,
            rate_limit: self.rate_limit_for(url),
        }
    }

    fn cascade_context(&self, url: &str, hls_available: bool) -> CascadeContext {
        CascadeContext {
            proxy: self.proxy.clone(),
            generic_allowed: self.generic_allowed(url),
            hls_available,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One user request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub user_id: UserId,
    pub url: String,
    pub quality: Quality,
    /// Deliver the file as downloaded, without compatibility conversion.
    pub raw_format: bool,
    pub force_audio: bool,
    pub force_hls: bool,
    /// Link the user sent, when `url` is a rewrite of it. Used as referer.
    pub source_url: Option<String>,
    /// Already-resolved audio track to mix into the video.
    pub external_audio: Option<String>,
    pub sponsor_trim: bool,
    /// Segment categories to cut; empty means the configured defaults.
    pub sponsor_categories: Vec<String>,
}

impl JobRequest {
    pub fn new(user_id: UserId, url: impl Into<String>) -> Self {
        Self {
            user_id,
            url: url.into(),
            quality: Quality::Auto,
            raw_format: false,
            force_audio: false,
            force_hls: false,
            source_url: None,
            external_audio: None,
            sponsor_trim: false,
            sponsor_categories: Vec::new(),
        }
    }

    pub fn wants_audio(&self) -> bool {
        self.force_audio || self.quality == Quality::Audio
    }
}

/// Per-job handles threaded through every stage.
#[derive(Clone)]
pub struct JobContext {
    pub target: DeliveryTarget,
    pub cancel: CancellationToken,
    registry: Option<Arc<JobRegistry>>,
}

impl JobContext {
    pub fn new(target: DeliveryTarget, cancel: CancellationToken) -> Self {
        Self {
            target,
            cancel,
            registry: None,
        }
    }

    /// Mirror stage and progress into the registry's job view.
    pub fn with_registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn set_stage(&self, stage: JobStage, progress: Option<f32>) {
        if let Some(registry) = &self.registry {
            registry.set_stage(self.target.job_id, stage, progress);
        }
    }

    fn check_cancel(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub extractor: Arc<dyn Extractor>,
    pub runner: Arc<dyn ProcessRunner>,
    pub sink: Arc<dyn DeliverySink>,
    pub segments: Arc<dyn SegmentProvider>,
    pub resolvers: ResolverChain,
    pub direct: Option<Arc<DirectFetcher>>,
    pub cooldown: Arc<CooldownTracker>,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PipelineOutput {
    Delivered {
        file_name: String,
        mode: DeliveryMode,
        size_bytes: u64,
        trimmed: Option<CutMethod>,
    },
    Photos {
        count: usize,
    },
}

pub struct Pipeline {
    deps: PipelineDeps,
    settings: PipelineSettings,
    trimmer: SegmentTrimmer,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let trimmer = SegmentTrimmer::new(deps.runner.clone(), &settings.ffmpeg_path);
        Self {
            deps,
            settings,
            trimmer,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Run one job to completion.
    pub async fn run(
        &self,
        request: &JobRequest,
        ctx: &JobContext,
    ) -> Result<PipelineOutput, PipelineError> {
        let span = info_span!(
            "pipeline",
            job_id = %ctx.target.job_id,
            user_id = ctx.target.user_id,
            url = %request.url
        );
        self.run_stages(request, ctx).instrument(span).await
    }

    async fn run_stages(
        &self,
        request: &JobRequest,
        ctx: &JobContext,
    ) -> Result<PipelineOutput, PipelineError> {
        ctx.check_cancel()?;
        self.stage(ctx, JobStage::Resolving, None, "Resolving link...").await;

        let mut url = request.url.clone();
        let mut referer = request.source_url.clone();
        match self.deps.resolvers.rewrite(&url, &ctx.cancel).await? {
            Some(Resolution::Photos(urls)) => {
                ctx.set_stage(JobStage::Delivering, None);
                self.deps
                    .sink
                    .deliver_photos(ctx.target, &urls)
                    .await
                    .map_err(|e| PipelineError::fatal(format!("photo delivery failed: {}", e)))?;
                return Ok(PipelineOutput::Photos { count: urls.len() });
            }
            Some(Resolution::Video(resolved)) => {
                referer = referer.or_else(|| Some(url.clone()));
                url = resolved;
            }
            None => {}
        }

        let workspace = JobWorkspace::create(&self.settings.temp_dir)?;
        let audio_only = request.wants_audio();

        if let Some(fetcher) = &self.deps.direct {
            if direct_media_extension(&url).is_some() {
                ctx.check_cancel()?;
                self.stage(ctx, JobStage::Downloading, None, "Downloading...").await;
                match fetcher
                    .fetch(&url, referer.as_deref(), workspace.path(), &ctx.cancel)
                    .await
                {
                    Ok(path) => {
                        let info = MediaInfo {
                            title: title_from_url(&url),
                            webpage_url: Some(url.clone()),
                            ..MediaInfo::default()
                        };
                        return self
                            .post_process(request, ctx, &workspace, &info, path)
                            .await;
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "direct fetch failed, trying the extractor");
                        workspace.clear()?;
                    }
                }
            }
        }

        ctx.check_cancel()?;
        let quality = if audio_only {
            Quality::Audio
        } else {
            request.quality.clone()
        };
        let initial = AttemptArgs {
            format: Some(build_selector(&quality, None, request.force_hls)),
            cookies: self.settings.cookies_file.clone(),
            referer: referer.clone(),
            ..AttemptArgs::default()
        };
        let (info, resolved_args) = self.resolve_metadata(&url, initial, &ctx.cancel).await?;

        ctx.check_cancel()?;
        let formats = info.entries();
        let explicit = match &quality {
            Quality::Format(id) => info.find_format(id),
            _ => None,
        };
        let selected = info.selected_entries();
        let decision = check_size_gate(
            &selected,
            &formats,
            info.duration,
            self.settings.max_upload_bytes,
            quality.allows_substitution(),
            self.settings.alternatives_limit,
            audio_only,
        );

        let (selector, chosen) = match decision {
            SizeDecision::Fits { estimated_bytes } => {
                debug!(?estimated_bytes, "selection fits");
                (
                    build_selector(&quality, explicit.as_ref(), request.force_hls),
                    selected,
                )
            }
            SizeDecision::Substitute {
                estimated_bytes,
                candidate,
            } => {
                info!(
                    estimated_mb = estimated_bytes / MIB,
                    format = %candidate.format_id,
                    "selection oversize, substituting"
                );
                self.status(
                    ctx,
                    &format!(
                        "Original is about {} MB, using {} instead",
                        estimated_bytes / MIB,
                        describe_candidate(&candidate)
                    ),
                )
                .await;
                let selector = if candidate.muxed || audio_only {
                    candidate.format_id.clone()
                } else {
                    format!("{id}+ba/{id}", id = candidate.format_id)
                };
                let chosen = info.find_format(&candidate.format_id).into_iter().collect();
                (selector, chosen)
            }
            SizeDecision::Alternatives {
                estimated_bytes,
                candidates,
            } => {
                self.deps
                    .sink
                    .offer_alternatives(ctx.target, &url, &candidates)
                    .await
                    .map_err(|e| PipelineError::fatal(format!("offering alternatives: {}", e)))?;
                return Err(self.oversize_error(estimated_bytes));
            }
            SizeDecision::NoneFit { estimated_bytes } => {
                return Err(self.oversize_error(estimated_bytes));
            }
        };

        let merge_format = if audio_only || request.raw_format {
            None
        } else {
            let (video, audio) = stream_codecs(&chosen);
            let plan = decide_container(video, audio, self.settings.require_aac_audio);
            debug!(container = %plan.container, transcode = ?plan.audio_transcode, "container planned");
            Some(plan.container.extension().to_string())
        };

        ctx.check_cancel()?;
        let args = AttemptArgs {
            format: Some(selector),
            ..resolved_args
        };
        let hls_available = formats.iter().any(|f| f.is_hls);
        self.download(&url, args, merge_format, hls_available, &workspace, ctx)
            .await?;

        let downloaded = find_downloaded_file(workspace.path())
            .ok_or_else(|| PipelineError::fatal("extractor finished without producing a file"))?;
        self.post_process(request, ctx, &workspace, &info, downloaded)
            .await
    }

    /// Metadata for a quality menu, resolved without a format filter.
    pub async fn resolve_info(
        &self,
        url: &str,
        referer: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, PipelineError> {
        let initial = AttemptArgs {
            cookies: self.settings.cookies_file.clone(),
            referer: referer.map(str::to_string),
            ..AttemptArgs::default()
        };
        let (info, _) = self.resolve_metadata(url, initial, cancel).await?;
        Ok(info)
    }

    async fn resolve_metadata(
        &self,
        url: &str,
        initial: AttemptArgs,
        cancel: &CancellationToken,
    ) -> Result<(MediaInfo, AttemptArgs), PipelineError> {
        let cascade = self.settings.cascade_context(url, false);
        let policy = self.settings.cascade_policy(url);
        let extractor = self.deps.extractor.as_ref();
        run_cascade(
            initial,
            METADATA_CASCADE,
            &cascade,
            &policy,
            &self.deps.cooldown,
            cancel,
            move |args, attempt| async move {
                debug!(attempt, "resolving metadata");
                let info = extractor.resolve(url, &args, cancel).await?;
                Ok((info, args))
            },
        )
        .await
    }

    async fn download(
        &self,
        url: &str,
        initial: AttemptArgs,
        merge_format: Option<String>,
        hls_available: bool,
        workspace: &JobWorkspace,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        self.stage(ctx, JobStage::Downloading, Some(0.0), "Downloading...")
            .await;
        let cascade = self.settings.cascade_context(url, hls_available);
        let policy = self.settings.cascade_policy(url);
        let merge_format = merge_format.as_deref();
        run_cascade(
            initial,
            DOWNLOAD_CASCADE,
            &cascade,
            &policy,
            &self.deps.cooldown,
            &ctx.cancel,
            move |args, attempt| async move {
                if attempt > 1 {
                    // leftovers from a failed attempt would be mistaken for output
                    workspace.clear()?;
                }
                let request = DownloadRequest {
                    url: url.to_string(),
                    args,
                    output_dir: workspace.path().to_path_buf(),
                    merge_format: merge_format.map(str::to_string),
                };
                self.download_attempt(&request, ctx).await
            },
        )
        .await
    }

    /// One extractor run, turning its output into throttled status texts.
    ///
    /// Every attempt starts with a fresh tracker.
    async fn download_attempt(
        &self,
        request: &DownloadRequest,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut tracker = ProgressTracker::new(
            self.settings.status_interval,
            self.settings.heartbeat,
            Instant::now(),
        );
        let mut tick = tokio::time::interval(STATUS_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let download = self.deps.extractor.download(request, tx, &ctx.cancel);
        tokio::pin!(download);
        let mut lines_open = true;

        loop {
            tokio::select! {
                result = &mut download => {
                    while let Ok(line) = rx.try_recv() {
                        observe_line(&line, &mut tracker, ctx);
                    }
                    return result;
                }
                line = rx.recv(), if lines_open => match line {
                    Some(line) => observe_line(&line, &mut tracker, ctx),
                    None => lines_open = false,
                },
                _ = tick.tick() => {
                    if let Some(text) = tracker.poll(Instant::now()) {
                        self.deps.sink.update_status(ctx.target, &text).await;
                    }
                }
            }
        }
    }

    async fn post_process(
        &self,
        request: &JobRequest,
        ctx: &JobContext,
        workspace: &JobWorkspace,
        info: &MediaInfo,
        downloaded: PathBuf,
    ) -> Result<PipelineOutput, PipelineError> {
        ctx.check_cancel()?;
        let runner = self.deps.runner.as_ref();
        let mut current = downloaded;

        let probe = match probe_file(runner, &self.settings.ffprobe_path, &current, &ctx.cancel)
            .await
        {
            Ok(probe) => Some(probe),
            Err(e) => {
                let e = PipelineError::from(e);
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(error = %e, "probe failed, skipping compatibility conversion");
                None
            }
        };
        let mut duration = probe
            .as_ref()
            .and_then(|p| p.duration_secs)
            .or(info.duration);

        if !request.raw_format {
            if let Some(probe) = &probe {
                if let Some(converted) = self
                    .ensure_compatible(&current, probe, workspace, ctx)
                    .await?
                {
                    current = converted;
                }
            }
        }

        if let Some(audio_url) = &request.external_audio {
            if probe.as_ref().map(ProbeResult::has_video).unwrap_or(true) {
                ctx.check_cancel()?;
                self.stage(ctx, JobStage::Converting, None, "Mixing in audio track...")
                    .await;
                let ext = match extension_of(&current).as_str() {
                    "webm" => "mkv".to_string(),
                    other => other.to_string(),
                };
                let out = workspace.file(&format!("mixed.{}", ext));
                let spec = build_external_audio_mux(
                    &self.settings.ffmpeg_path,
                    &current,
                    audio_url,
                    &out,
                    MixMode::default(),
                );
                run_ffmpeg(runner, &spec, &ctx.cancel).await?;
                current = out;
            }
        }

        let mut trimmed = None;
        if request.sponsor_trim && info.is_youtube() {
            if let Some(media_id) = &info.id {
                ctx.check_cancel()?;
                if let Some((path, method, kept)) = self
                    .trim_sponsors(media_id, request, &current, probe.as_ref(), duration, workspace, ctx)
                    .await?
                {
                    current = path;
                    trimmed = Some(method);
                    duration = Some(kept);
                }
            }
        }

        ctx.check_cancel()?;
        let ext = extension_of(&current);
        let final_path = finalize_file(&current, info.title.as_deref(), &ext)?;
        let size_bytes = tokio::fs::metadata(&final_path).await?.len();
        if size_bytes >= self.settings.max_upload_bytes {
            return Err(self.oversize_error(size_bytes));
        }

        let mode = if request.raw_format {
            DeliveryMode::Document
        } else {
            Container::from_extension(&ext)
                .map(DeliveryMode::for_container)
                .unwrap_or(DeliveryMode::Document)
        };
        let meta = DeliveryMeta {
            title: info.title.clone(),
            duration_secs: duration,
            width: probe.as_ref().map(|p| p.width).unwrap_or(0),
            height: probe.as_ref().map(|p| p.height).unwrap_or(0),
            source_url: request
                .source_url
                .clone()
                .unwrap_or_else(|| request.url.clone()),
            size_bytes,
        };

        ctx.check_cancel()?;
        self.stage(ctx, JobStage::Delivering, None, "Uploading...").await;
        let mode = deliver_with_fallback(
            self.deps.sink.as_ref(),
            ctx.target,
            &final_path,
            &meta,
            mode,
        )
        .await
        .map_err(|e| PipelineError::fatal(format!("delivery failed: {}", e)))?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %file_name, ?mode, size_bytes, "delivered");
        Ok(PipelineOutput::Delivered {
            file_name,
            mode,
            size_bytes,
            trimmed,
        })
    }

    /// Remux or re-encode audio when the file's codecs do not suit its
    /// container or the delivery profile.
    async fn ensure_compatible(
        &self,
        input: &Path,
        probe: &ProbeResult,
        workspace: &JobWorkspace,
        ctx: &JobContext,
    ) -> Result<Option<PathBuf>, PipelineError> {
        if !probe.has_video() && !probe.has_audio() {
            return Ok(None);
        }
        let plan = decide_container(
            probe.video_codec,
            probe.audio_codec,
            self.settings.require_aac_audio,
        );
        let current = Container::from_extension(&extension_of(input));
        if plan.audio_transcode.is_none() && current == Some(plan.container) {
            return Ok(None);
        }

        ctx.check_cancel()?;
        self.stage(ctx, JobStage::Converting, None, "Converting for playback...")
            .await;
        let out = workspace.file(&format!("converted.{}", plan.container.extension()));
        let spec = match plan.audio_transcode {
            Some(target) => {
                build_audio_transcode(&self.settings.ffmpeg_path, input, &out, target)
            }
            None => build_remux(&self.settings.ffmpeg_path, input, &out),
        };
        run_ffmpeg(self.deps.runner.as_ref(), &spec, &ctx.cancel).await?;
        info!(container = %plan.container, transcode = ?plan.audio_transcode, "converted");
        Ok(Some(out))
    }

    /// Cut sponsor segments out of `input`.
    ///
    /// Returns the trimmed file, the cut path used and the kept duration, or
    /// `None` when there is nothing to cut. Provider and cut failures leave
    /// the file untrimmed rather than failing the job.
    #[allow(clippy::too_many_arguments)]
    async fn trim_sponsors(
        &self,
        media_id: &str,
        request: &JobRequest,
        input: &Path,
        probe: Option<&ProbeResult>,
        duration: Option<f64>,
        workspace: &JobWorkspace,
        ctx: &JobContext,
    ) -> Result<Option<(PathBuf, CutMethod, f64)>, PipelineError> {
        self.stage(ctx, JobStage::Trimming, None, "Removing sponsored segments...")
            .await;
        let categories = if request.sponsor_categories.is_empty() {
            &self.settings.sponsor_categories
        } else {
            &request.sponsor_categories
        };
        let segments = match self
            .deps
            .segments
            .fetch_segments(media_id, categories, &ctx.cancel)
            .await
        {
            Ok(segments) => segments,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(media_id, error = %e, "segment lookup failed, not trimming");
                return Ok(None);
            }
        };
        let Some(duration) = duration else {
            warn!(media_id, "duration unknown, not trimming");
            return Ok(None);
        };
        let Some(keep) = plan_keep_ranges(&segments, duration) else {
            debug!(media_id, segments = segments.len(), "nothing to trim");
            return Ok(None);
        };

        let parts = workspace.file("parts");
        tokio::fs::create_dir_all(&parts).await?;
        let out = workspace.file(&format!("trimmed.{}", extension_of(input)));
        let probe = probe.cloned().unwrap_or_default();
        match self
            .trimmer
            .cut(input, &keep, &probe, &parts, &out, &ctx.cancel)
            .await
        {
            Ok(method) => {
                let kept: f64 = keep.iter().map(Interval::duration).sum();
                info!(media_id, ?method, ranges = keep.len(), kept_secs = kept, "sponsor segments removed");
                Ok(Some((out, method, kept)))
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(media_id, error = %e, "trim failed, delivering untrimmed");
                Ok(None)
            }
        }
    }

    async fn stage(&self, ctx: &JobContext, stage: JobStage, progress: Option<f32>, text: &str) {
        ctx.set_stage(stage, progress);
        debug!(%stage, "stage");
        self.deps.sink.update_status(ctx.target, text).await;
    }

    async fn status(&self, ctx: &JobContext, text: &str) {
        self.deps.sink.update_status(ctx.target, text).await;
    }

    fn oversize_error(&self, bytes: u64) -> PipelineError {
        PipelineError::oversize(format!(
            "about {} MB, over the {} MB delivery limit",
            bytes / MIB,
            self.settings.max_upload_bytes / MIB
        ))
    }
}

fn observe_line(line: &str, tracker: &mut ProgressTracker, ctx: &JobContext) {
    if let Some(event) = parse_progress_line(line) {
        tracker.observe(&event, Instant::now());
        ctx.set_stage(tracker.stage(), tracker.percent());
    }
}

/// Video and audio codec families of the streams about to be merged.
fn stream_codecs(chosen: &[FormatEntry]) -> (VideoCodec, AudioCodec) {
    let video = chosen
        .iter()
        .find(|e| e.has_video)
        .map(|e| e.video_codec)
        .unwrap_or(VideoCodec::Unknown);
    let audio = chosen
        .iter()
        .find(|e| e.has_audio)
        .map(|e| e.audio_codec)
        .unwrap_or(AudioCodec::Unknown);
    (video, audio)
}

fn describe_candidate(candidate: &SizedCandidate) -> String {
    match candidate.height {
        Some(h) => format!("{}p (~{} MB)", h, candidate.estimated_bytes / MIB),
        None => format!("format {} (~{} MB)", candidate.format_id, candidate.estimated_bytes / MIB),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| Container::Mp4.extension().to_string())
}

/// File stem of the URL's last path segment.
fn title_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    let stem = last.rsplit_once('.').map(|(s, _)| s).unwrap_or(last);
    (!stem.is_empty()).then(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            rate_limited_hosts: vec!["instagram.com".into()],
            generic_extractor_hosts: vec!["example.org".into()],
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn test_rate_limit_policy_keyed_by_domain() {
        let s = settings();
        let policy = s.rate_limit_for("https://www.instagram.com/reel/abc").unwrap();
        assert_eq!(policy.host, "instagram.com");
        assert_eq!(policy.base_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 3);
        assert!(s.rate_limit_for("https://cdn.instagram.com/x.mp4").is_some());
        assert!(s.rate_limit_for("https://youtube.com/watch?v=1").is_none());
    }

    #[test]
    fn test_generic_allowed_by_host() {
        let s = settings();
        assert!(s.generic_allowed("https://video.example.org/1"));
        assert!(!s.generic_allowed("https://example.com/1"));
    }

    #[test]
    fn test_title_from_url() {
        assert_eq!(
            title_from_url("https://cdn.example.com/a/Holiday%20clip.mp4?x=1").as_deref(),
            Some("Holiday%20clip")
        );
        assert_eq!(title_from_url("https://cdn.example.com/"), None);
    }

    #[test]
    fn test_stream_codecs_defaults_unknown() {
        assert_eq!(stream_codecs(&[]), (VideoCodec::Unknown, AudioCodec::Unknown));
    }

    #[test]
    fn test_request_wants_audio() {
        let mut request = JobRequest::new(1, "https://example.com/v");
        assert!(!request.wants_audio());
        request.force_audio = true;
        assert!(request.wants_audio());
        request.force_audio = false;
        request.quality = Quality::Audio;
        assert!(request.wants_audio());
    }
}
