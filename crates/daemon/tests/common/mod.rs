//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use media_fetch_daemon::attempts::AttemptArgs;
use media_fetch_daemon::formats::RawFormat;
use media_fetch_daemon::jobs::{JobId, JobOutcome};
use media_fetch_daemon::size_gate::SizedCandidate;
use media_fetch_daemon::{
    CommandSpec, ConcurrencyPlan, CooldownTracker, DeliveryMeta, DeliveryMode, DeliverySink,
    DeliveryTarget, DownloadRequest, ErrorKind, Extractor, Interval, MediaInfo, Orchestrator,
    Pipeline, PipelineDeps, PipelineError, PipelineSettings, ProcessError, ProcessOutput,
    ProcessRunner, SegmentProvider, SinkError,
};
use media_fetch_daemon::resolver::ResolverChain;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const AVC_AAC_PROBE: &str = r#"{
    "streams": [
        {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720},
        {"codec_type": "audio", "codec_name": "aac"}
    ],
    "format": {"duration": "600.0", "size": "4096"}
}"#;

pub const VP9_OPUS_PROBE: &str = r#"{
    "streams": [
        {"codec_type": "video", "codec_name": "vp9", "width": 1920, "height": 1080},
        {"codec_type": "audio", "codec_name": "opus"}
    ],
    "format": {"duration": "600.0", "size": "4096"}
}"#;

pub fn muxed_format(id: &str, height: u32, bytes: f64) -> RawFormat {
    RawFormat {
        format_id: id.to_string(),
        ext: Some("mp4".to_string()),
        vcodec: Some("avc1.64001f".to_string()),
        acodec: Some("mp4a.40.2".to_string()),
        filesize: Some(bytes),
        height: Some(height),
        protocol: Some("https".to_string()),
        ..RawFormat::default()
    }
}

pub fn video_only_format(id: &str, height: u32, bytes: f64) -> RawFormat {
    RawFormat {
        format_id: id.to_string(),
        ext: Some("mp4".to_string()),
        vcodec: Some("avc1.640028".to_string()),
        acodec: Some("none".to_string()),
        filesize: Some(bytes),
        height: Some(height),
        protocol: Some("https".to_string()),
        ..RawFormat::default()
    }
}

pub fn audio_format(id: &str, bytes: f64) -> RawFormat {
    RawFormat {
        format_id: id.to_string(),
        ext: Some("m4a".to_string()),
        vcodec: Some("none".to_string()),
        acodec: Some("mp4a.40.2".to_string()),
        filesize: Some(bytes),
        protocol: Some("https".to_string()),
        ..RawFormat::default()
    }
}

/// A short clip with one small muxed format, selected.
pub fn small_clip(id: &str) -> MediaInfo {
    let format = muxed_format("18", 360, 5_000_000.0);
    MediaInfo {
        id: Some(id.to_string()),
        title: Some(format!("Clip {}", id)),
        duration: Some(600.0),
        extractor_key: Some("Generic".to_string()),
        formats: vec![format.clone()],
        requested_formats: Some(vec![format]),
        ..MediaInfo::default()
    }
}

/// Scripted extractor.
///
/// Downloads write `{id}.{ext}` into the output directory. Failures are
/// popped from the scripts before success is attempted.
pub struct FakeExtractor {
    info: Mutex<MediaInfo>,
    output_ext: String,
    output_bytes: usize,
    resolve_failures: Mutex<VecDeque<ErrorKind>>,
    download_failures: Mutex<VecDeque<ErrorKind>>,
    progress_lines: Vec<String>,
    hold: Option<Arc<Semaphore>>,
    delay: Duration,
    pub resolve_calls: Mutex<Vec<AttemptArgs>>,
    pub download_calls: Mutex<Vec<DownloadRequest>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl FakeExtractor {
    pub fn new(info: MediaInfo) -> Self {
        Self {
            info: Mutex::new(info),
            output_ext: "mp4".to_string(),
            output_bytes: 4096,
            resolve_failures: Mutex::new(VecDeque::new()),
            download_failures: Mutex::new(VecDeque::new()),
            progress_lines: vec![
                "[download]  10.0% of 5.00MiB at 1.00MiB/s ETA 00:04".to_string(),
                "[download] 100.0% of 5.00MiB at 1.00MiB/s ETA 00:00".to_string(),
            ],
            hold: None,
            delay: Duration::ZERO,
            resolve_calls: Mutex::new(Vec::new()),
            download_calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn output_ext(mut self, ext: &str) -> Self {
        self.output_ext = ext.to_string();
        self
    }

    pub fn failing_resolves(self, kinds: Vec<ErrorKind>) -> Self {
        *self.resolve_failures.lock().unwrap() = kinds.into();
        self
    }

    pub fn failing_downloads(self, kinds: Vec<ErrorKind>) -> Self {
        *self.download_failures.lock().unwrap() = kinds.into();
        self
    }

    /// Downloads block until a permit is available or the job is cancelled.
    pub fn held_by(mut self, gate: Arc<Semaphore>) -> Self {
        self.hold = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn download_count(&self) -> usize {
        self.download_calls.lock().unwrap().len()
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_calls.lock().unwrap().len()
    }

    async fn wait_turn(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if let Some(gate) = &self.hold {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }
        if !self.delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        Ok(())
    }

    async fn run_download(
        &self,
        request: &DownloadRequest,
        lines: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for line in &self.progress_lines {
            let _ = lines.send(line.clone());
        }
        self.wait_turn(cancel).await?;
        let failure = self.download_failures.lock().unwrap().pop_front();
        if let Some(kind) = failure {
            return Err(PipelineError::new(kind, "scripted download failure"));
        }
        let id = self.info.lock().unwrap().id.clone().unwrap_or_else(|| "media".to_string());
        let path = request
            .output_dir
            .join(format!("{}.{}", id, self.output_ext));
        std::fs::write(path, vec![0u8; self.output_bytes])?;
        Ok(())
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn resolve(
        &self,
        _url: &str,
        args: &AttemptArgs,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, PipelineError> {
        self.resolve_calls.lock().unwrap().push(args.clone());
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }
        let failure = self.resolve_failures.lock().unwrap().pop_front();
        if let Some(kind) = failure {
            return Err(PipelineError::new(kind, "scripted resolve failure"));
        }
        Ok(self.info.lock().unwrap().clone())
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        lines: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.download_calls.lock().unwrap().push(request.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let result = self.run_download(request, lines, cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Answers ffprobe with canned JSON and makes ffmpeg write its output path.
pub struct FakeRunner {
    probe_json: String,
    fail_matching: Option<String>,
    pub calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new(probe_json: &str) -> Self {
        Self {
            probe_json: probe_json.to_string(),
            fail_matching: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// ffmpeg invocations with an argument containing `needle` fail.
    pub fn failing_when(mut self, needle: &str) -> Self {
        self.fail_matching = Some(needle.to_string());
        self
    }

    pub fn ffmpeg_calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tool_name() == "ffmpeg")
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        _lines: Option<UnboundedSender<String>>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        self.calls.lock().unwrap().push(spec.clone());
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        match spec.tool_name().as_str() {
            "ffprobe" => Ok(ProcessOutput {
                stdout: self.probe_json.clone(),
                stderr_tail: String::new(),
            }),
            _ => {
                if let Some(needle) = &self.fail_matching {
                    if spec.args.iter().any(|a| a.contains(needle.as_str())) {
                        return Err(ProcessError::Exit {
                            program: spec.program.clone(),
                            code: Some(1),
                            tail: "Invalid data found when processing input".to_string(),
                        });
                    }
                }
                if let Some(out) = spec.args.last() {
                    std::fs::write(out, vec![1u8; 2048])?;
                }
                Ok(ProcessOutput::default())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job_id: JobId,
    pub file_name: String,
    pub size_bytes: u64,
    pub mode: DeliveryMode,
    pub meta: DeliveryMeta,
}

/// Records everything the pipeline hands to the transport.
#[derive(Default)]
pub struct RecordingSink {
    pub reject_inline: bool,
    pub statuses: Mutex<Vec<String>>,
    pub deliveries: Mutex<Vec<Delivery>>,
    pub photos: Mutex<Vec<String>>,
    pub alternatives: Mutex<Vec<SizedCandidate>>,
    pub finished: Mutex<Vec<(JobId, JobOutcome, Option<ErrorKind>)>>,
}

impl RecordingSink {
    pub fn outcomes(&self) -> Vec<JobOutcome> {
        self.finished.lock().unwrap().iter().map(|(_, o, _)| *o).collect()
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn update_status(&self, _target: DeliveryTarget, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }

    async fn deliver(
        &self,
        target: DeliveryTarget,
        file: &Path,
        meta: &DeliveryMeta,
        mode: DeliveryMode,
    ) -> Result<(), SinkError> {
        if self.reject_inline && mode != DeliveryMode::Document {
            return Err(SinkError::Rejected("inline upload refused".into()));
        }
        let size_bytes = std::fs::metadata(file)?.len();
        self.deliveries.lock().unwrap().push(Delivery {
            job_id: target.job_id,
            file_name: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes,
            mode,
            meta: meta.clone(),
        });
        Ok(())
    }

    async fn deliver_photos(&self, _target: DeliveryTarget, urls: &[String]) -> Result<(), SinkError> {
        self.photos.lock().unwrap().extend(urls.iter().cloned());
        Ok(())
    }

    async fn offer_alternatives(
        &self,
        _target: DeliveryTarget,
        _url: &str,
        candidates: &[SizedCandidate],
    ) -> Result<(), SinkError> {
        self.alternatives.lock().unwrap().extend(candidates.iter().cloned());
        Ok(())
    }

    async fn job_finished(
        &self,
        target: DeliveryTarget,
        outcome: JobOutcome,
        error: Option<&PipelineError>,
    ) {
        self.finished
            .lock()
            .unwrap()
            .push((target.job_id, outcome, error.map(|e| e.kind)));
    }
}

/// Serves a fixed segment list.
#[derive(Default)]
pub struct StaticSegments {
    pub segments: Vec<Interval>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SegmentProvider for StaticSegments {
    async fn fetch_segments(
        &self,
        _media_id: &str,
        _categories: &[String],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Interval>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.segments.clone())
    }
}

pub struct Harness {
    pub extractor: Arc<FakeExtractor>,
    pub runner: Arc<FakeRunner>,
    pub sink: Arc<RecordingSink>,
    pub segments: Arc<StaticSegments>,
    pub temp: tempfile::TempDir,
}

impl Harness {
    pub fn new(extractor: FakeExtractor) -> Self {
        Self::with_parts(extractor, FakeRunner::new(AVC_AAC_PROBE), RecordingSink::default())
    }

    pub fn with_parts(extractor: FakeExtractor, runner: FakeRunner, sink: RecordingSink) -> Self {
        Self {
            extractor: Arc::new(extractor),
            runner: Arc::new(runner),
            sink: Arc::new(sink),
            segments: Arc::new(StaticSegments::default()),
            temp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn with_segments(mut self, segments: Vec<Interval>) -> Self {
        self.segments = Arc::new(StaticSegments {
            segments,
            calls: AtomicUsize::new(0),
        });
        self
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            temp_dir: self.workspace_root(),
            transient_backoff: Duration::from_millis(10),
            rate_limit_base_delay: Duration::from_millis(10),
            ..PipelineSettings::default()
        }
    }

    pub fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            extractor: self.extractor.clone(),
            runner: self.runner.clone(),
            sink: self.sink.clone(),
            segments: self.segments.clone(),
            resolvers: ResolverChain::new(),
            direct: None,
            cooldown: Arc::new(CooldownTracker::new()),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.deps(), self.settings())
    }

    pub fn orchestrator(&self, max_global_tasks: usize, queue_concurrency: usize) -> Orchestrator {
        let plan = ConcurrencyPlan {
            max_global_tasks,
            max_user_urls: 3,
            queue_concurrency,
        };
        Orchestrator::new(plan, self.pipeline(), Duration::from_secs(3600))
    }

    /// Job workspaces still on disk.
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspace_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
