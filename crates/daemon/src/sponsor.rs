//! Sponsor segment removal.
//!
//! Segments reported by the segment database are merged into disjoint
//! intervals, inverted into keep-ranges over the media duration, and the
//! keep-ranges are cut out of the file. Cutting tries stream copy first and
//! only re-encodes when every lossless path fails.

use crate::classify::{Container, VideoCodec};
use crate::encode::ffmpeg::{
    build_concat_demuxer, build_concat_protocol, build_cut, build_filter_trim, build_to_mpegts,
    concat_list, run_ffmpeg,
};
use crate::error::{ErrorKind, PipelineError};
use crate::probe::ProbeResult;
use crate::process::ProcessRunner;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gap below which neighbouring intervals are treated as touching.
pub const EPSILON: f64 = 0.3;

/// Half-open time interval `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    fn is_valid(&self) -> bool {
        self.start.is_finite() && self.end.is_finite() && self.end > self.start
    }
}

/// Sort and coalesce segments into a disjoint, ascending set.
///
/// A segment starting within [`EPSILON`] of the running end joins it.
/// Empty, reversed and non-finite segments are dropped.
pub fn merge_segments(segments: &[Interval]) -> Vec<Interval> {
    let mut sorted: Vec<Interval> = segments.iter().copied().filter(Interval::is_valid).collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for seg in sorted {
        match merged.last_mut() {
            Some(current) if seg.start <= current.end + EPSILON => {
                current.end = current.end.max(seg.end);
            }
            _ => merged.push(seg),
        }
    }
    merged
}

/// Complement of `merged` over `[0, duration)`.
///
/// Gaps no longer than [`EPSILON`] are not worth keeping.
pub fn invert_segments(merged: &[Interval], duration: f64) -> Vec<Interval> {
    let mut keep = Vec::new();
    if !(duration.is_finite() && duration > 0.0) {
        return keep;
    }
    let mut cursor = 0.0f64;
    for seg in merged {
        let start = seg.start.clamp(0.0, duration);
        if start - cursor > EPSILON {
            keep.push(Interval::new(cursor, start));
        }
        cursor = cursor.max(seg.end.min(duration));
    }
    if duration - cursor > EPSILON {
        keep.push(Interval::new(cursor, duration));
    }
    keep
}

/// Seconds of `[0, duration)` covered by `merged`.
pub fn removed_duration(merged: &[Interval], duration: f64) -> f64 {
    merged
        .iter()
        .map(|s| (s.end.min(duration) - s.start.max(0.0)).max(0.0))
        .sum()
}

/// Keep-ranges for `segments`, or `None` when cutting would be pointless.
///
/// Nothing is cut when no segment intersects the media or when the segments
/// would remove everything.
pub fn plan_keep_ranges(segments: &[Interval], duration: f64) -> Option<Vec<Interval>> {
    let merged = merge_segments(segments);
    if removed_duration(&merged, duration) <= EPSILON {
        return None;
    }
    let keep = invert_segments(&merged, duration);
    if keep.is_empty() {
        return None;
    }
    Some(keep)
}

/// Source of skip segments for a media id.
#[async_trait]
pub trait SegmentProvider: Send + Sync {
    async fn fetch_segments(
        &self,
        media_id: &str,
        categories: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Interval>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct SkipSegment {
    segment: [f64; 2],
    #[serde(default)]
    category: Option<String>,
}

/// [`SegmentProvider`] backed by the public skip-segment HTTP API.
pub struct HttpSegmentProvider {
    client: Client,
    api_base: String,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpSegmentProvider {
    pub fn new(api_base: &str, max_attempts: u32) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| PipelineError::fatal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_secs(1),
        })
    }

    /// Linear backoff step between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_once(
        &self,
        media_id: &str,
        categories: &[String],
    ) -> Result<Vec<Interval>, PipelineError> {
        let categories = serde_json::to_string(categories)
            .map_err(|e| PipelineError::fatal(format!("categories: {}", e)))?;
        let response = self
            .client
            .get(format!("{}/api/skipSegments", self.api_base))
            .query(&[("videoID", media_id), ("categories", categories.as_str())])
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::Fatal
                };
                PipelineError::new(kind, format!("segment request failed: {}", e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::new(
                ErrorKind::TransientNetwork,
                format!("segment service returned {}", status),
            ));
        }
        if !status.is_success() {
            return Err(PipelineError::fatal(format!(
                "segment service returned {}",
                status
            )));
        }

        let segments: Vec<SkipSegment> = response
            .json()
            .await
            .map_err(|e| PipelineError::fatal(format!("unreadable segment list: {}", e)))?;
        Ok(segments
            .into_iter()
            .inspect(|s| debug!(category = ?s.category, start = s.segment[0], end = s.segment[1], "segment"))
            .map(|s| Interval::new(s.segment[0], s.segment[1]))
            .collect())
    }
}

#[async_trait]
impl SegmentProvider for HttpSegmentProvider {
    async fn fetch_segments(
        &self,
        media_id: &str,
        categories: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Interval>, PipelineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                r = self.fetch_once(media_id, categories) => r,
                _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
            };
            match result {
                Err(e) if e.kind == ErrorKind::TransientNetwork && attempt < self.max_attempts => {
                    warn!(media_id, attempt, error = %e.message, "segment fetch failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff.saturating_mul(attempt)) => {}
                        _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
                    }
                }
                other => return other,
            }
        }
    }
}

/// Which cut path produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutMethod {
    StreamCopy,
    ConcatDemuxer,
    BitstreamConcat,
    Reencode,
}

/// Cuts keep-ranges out of a media file with ffmpeg.
pub struct SegmentTrimmer {
    runner: Arc<dyn ProcessRunner>,
    ffmpeg: String,
}

impl SegmentTrimmer {
    pub fn new(runner: Arc<dyn ProcessRunner>, ffmpeg: &str) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.to_string(),
        }
    }

    /// Write the kept portions of `input` to `output`.
    ///
    /// Intermediate parts go to `workdir`, which the caller owns and cleans.
    pub async fn cut(
        &self,
        input: &Path,
        keep: &[Interval],
        probe: &ProbeResult,
        workdir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<CutMethod, PipelineError> {
        if keep.is_empty() {
            return Err(PipelineError::fatal("nothing left to keep"));
        }
        let runner = self.runner.as_ref();

        if let [single] = keep {
            let spec = build_cut(&self.ffmpeg, input, single, output);
            match run_ffmpeg(runner, &spec, cancel).await {
                Ok(()) => return Ok(CutMethod::StreamCopy),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e.message, "stream-copy trim failed, re-encoding"),
            }
            return self.reencode(input, keep, probe, output, cancel).await;
        }

        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(Container::Mp4.extension());
        let mut parts = Vec::with_capacity(keep.len());
        let mut copied = true;
        for (i, range) in keep.iter().enumerate() {
            let part = workdir.join(format!("part_{i}.{ext}"));
            let spec = build_cut(&self.ffmpeg, input, range, &part);
            match run_ffmpeg(runner, &spec, cancel).await {
                Ok(()) => parts.push(part),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(part = i, error = %e.message, "stream-copy part failed");
                    copied = false;
                    break;
                }
            }
        }

        if copied {
            match self.concat_demuxer(&parts, workdir, output, cancel).await {
                Ok(()) => return Ok(CutMethod::ConcatDemuxer),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e.message, "concat demuxer failed"),
            }
            match self.concat_bitstream(&parts, probe.video_codec, output, cancel).await {
                Ok(()) => return Ok(CutMethod::BitstreamConcat),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e.message, "bitstream concat failed"),
            }
        }

        info!(ranges = keep.len(), "falling back to filter-graph re-encode");
        self.reencode(input, keep, probe, output, cancel).await
    }

    async fn concat_demuxer(
        &self,
        parts: &[PathBuf],
        workdir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let list = workdir.join("concat.txt");
        tokio::fs::write(&list, concat_list(parts)).await?;
        let spec = build_concat_demuxer(&self.ffmpeg, &list, output);
        run_ffmpeg(self.runner.as_ref(), &spec, cancel).await
    }

    async fn concat_bitstream(
        &self,
        parts: &[PathBuf],
        video: VideoCodec,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut ts_parts = Vec::with_capacity(parts.len());
        for part in parts {
            let ts = part.with_extension("ts");
            let spec = build_to_mpegts(&self.ffmpeg, part, video, &ts);
            run_ffmpeg(self.runner.as_ref(), &spec, cancel).await?;
            ts_parts.push(ts);
        }
        let spec = build_concat_protocol(&self.ffmpeg, &ts_parts, output);
        run_ffmpeg(self.runner.as_ref(), &spec, cancel).await
    }

    async fn reencode(
        &self,
        input: &Path,
        keep: &[Interval],
        probe: &ProbeResult,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<CutMethod, PipelineError> {
        let spec = build_filter_trim(&self.ffmpeg, input, keep, probe.has_audio(), output);
        run_ffmpeg(self.runner.as_ref(), &spec, cancel).await?;
        Ok(CutMethod::Reencode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AudioCodec;
    use crate::process::{CommandSpec, ProcessError, ProcessOutput};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn iv(start: f64, end: f64) -> Interval {
        Interval::new(start, end)
    }

    #[test]
    fn test_merge_overlapping_and_near() {
        let merged = merge_segments(&[iv(19.0, 30.0), iv(10.0, 20.0), iv(40.0, 42.0)]);
        assert_eq!(merged, vec![iv(10.0, 30.0), iv(40.0, 42.0)]);

        // within epsilon of the running end
        let merged = merge_segments(&[iv(0.0, 5.0), iv(5.25, 8.0)]);
        assert_eq!(merged, vec![iv(0.0, 8.0)]);

        // contained segment does not shrink the end
        let merged = merge_segments(&[iv(0.0, 50.0), iv(10.0, 20.0)]);
        assert_eq!(merged, vec![iv(0.0, 50.0)]);
    }

    #[test]
    fn test_merge_drops_invalid() {
        let merged = merge_segments(&[iv(5.0, 5.0), iv(9.0, 3.0), iv(f64::NAN, 1.0), iv(1.0, 2.0)]);
        assert_eq!(merged, vec![iv(1.0, 2.0)]);
    }

    #[test]
    fn test_invert() {
        assert_eq!(
            invert_segments(&[iv(10.0, 30.0)], 100.0),
            vec![iv(0.0, 10.0), iv(30.0, 100.0)]
        );
        // leading and trailing slivers under epsilon are dropped
        assert_eq!(
            invert_segments(&[iv(0.2, 30.0), iv(40.0, 99.9)], 100.0),
            vec![iv(30.0, 40.0)]
        );
        // segment past the end is clipped
        assert_eq!(invert_segments(&[iv(90.0, 150.0)], 100.0), vec![iv(0.0, 90.0)]);
        assert!(invert_segments(&[], 0.0).is_empty());
    }

    #[test]
    fn test_plan_keep_ranges() {
        assert_eq!(plan_keep_ranges(&[], 100.0), None);
        assert_eq!(plan_keep_ranges(&[iv(200.0, 210.0)], 100.0), None);
        assert_eq!(plan_keep_ranges(&[iv(0.0, 100.0)], 100.0), None);
        assert_eq!(
            plan_keep_ranges(&[iv(0.0, 15.0)], 100.0),
            Some(vec![iv(15.0, 100.0)])
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Keep-ranges are sorted, disjoint, inside [0, duration], and together
        // with the removed time account for the whole duration.
        #[test]
        fn prop_keep_ranges_partition_duration(
            raw in prop::collection::vec((0.0f64..600.0, 0.5f64..60.0), 0..12),
            duration in 1.0f64..600.0,
        ) {
            let segments: Vec<Interval> = raw.iter().map(|(s, len)| iv(*s, s + len)).collect();
            let merged = merge_segments(&segments);
            for pair in merged.windows(2) {
                prop_assert!(pair[0].end + EPSILON < pair[1].start);
            }

            let keep = invert_segments(&merged, duration);
            for range in &keep {
                prop_assert!(range.start >= 0.0 && range.end <= duration);
                prop_assert!(range.end > range.start);
            }
            for pair in keep.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }

            let kept: f64 = keep.iter().map(Interval::duration).sum();
            let removed = removed_duration(&merged, duration);
            // only sub-epsilon slivers may go missing, at most one per gap
            let slack = EPSILON * (merged.len() as f64 + 1.0) + 1e-9;
            prop_assert!(kept + removed <= duration + 1e-9);
            prop_assert!(kept + removed >= duration - slack);
        }
    }

    #[tokio::test]
    async fn test_http_provider_parses_segments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/skipSegments"))
            .and(query_param("videoID", "abc123"))
            .and(query_param("categories", r#"["sponsor","selfpromo"]"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"segment": [10.0, 20.0], "category": "sponsor", "UUID": "x"},
                {"segment": [40.5, 42.0], "category": "selfpromo"}
            ])))
            .mount(&server)
            .await;

        let provider = HttpSegmentProvider::new(&server.uri(), 3).unwrap();
        let segments = provider
            .fetch_segments(
                "abc123",
                &["sponsor".to_string(), "selfpromo".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(segments, vec![iv(10.0, 20.0), iv(40.5, 42.0)]);
    }

    #[tokio::test]
    async fn test_http_provider_not_found_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/skipSegments"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpSegmentProvider::new(&server.uri(), 3).unwrap();
        let segments = provider
            .fetch_segments("nothing", &["sponsor".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn test_http_provider_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/skipSegments"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let provider = HttpSegmentProvider::new(&server.uri(), 3)
            .unwrap()
            .with_backoff(Duration::from_millis(10));
        let err = provider
            .fetch_segments("abc", &["sponsor".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientNetwork);
    }

    #[tokio::test]
    async fn test_http_provider_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/skipSegments"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpSegmentProvider::new(&server.uri(), 3).unwrap();
        let err = provider
            .fetch_segments("abc", &["sponsor".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    /// Fails any command whose output path ends with one of `fail_suffixes`.
    struct ScriptedFfmpeg {
        fail_suffixes: Vec<&'static str>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl ProcessRunner for ScriptedFfmpeg {
        async fn run(
            &self,
            spec: &CommandSpec,
            _lines: Option<UnboundedSender<String>>,
            _cancel: &CancellationToken,
        ) -> Result<ProcessOutput, ProcessError> {
            self.seen.lock().unwrap().push(spec.clone());
            let out = spec.args.last().cloned().unwrap_or_default();
            if self.fail_suffixes.iter().any(|s| out.ends_with(s)) {
                return Err(ProcessError::Exit {
                    program: "ffmpeg".into(),
                    code: Some(1),
                    tail: "Invalid data found when processing input".into(),
                });
            }
            Ok(ProcessOutput::default())
        }
    }

    fn probe() -> ProbeResult {
        ProbeResult {
            duration_secs: Some(100.0),
            video_codec: VideoCodec::Avc,
            audio_codec: AudioCodec::Aac,
            ..ProbeResult::default()
        }
    }

    async fn run_cut(fail: Vec<&'static str>, keep: &[Interval]) -> (CutMethod, Vec<CommandSpec>) {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedFfmpeg {
            fail_suffixes: fail,
            seen: Mutex::new(Vec::new()),
        });
        let trimmer = SegmentTrimmer::new(runner.clone(), "ffmpeg");
        let method = trimmer
            .cut(
                &dir.path().join("in.mp4"),
                keep,
                &probe(),
                dir.path(),
                &dir.path().join("trimmed.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let seen = runner.seen.lock().unwrap().clone();
        (method, seen)
    }

    #[tokio::test]
    async fn test_cut_single_range_stream_copy() {
        let (method, seen) = run_cut(vec![], &[iv(15.0, 100.0)]).await;
        assert_eq!(method, CutMethod::StreamCopy);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_cut_multi_range_prefers_demuxer() {
        let (method, seen) = run_cut(vec![], &[iv(0.0, 10.0), iv(30.0, 100.0)]).await;
        assert_eq!(method, CutMethod::ConcatDemuxer);
        // two parts and one concat
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].arg_value("-f"), Some("concat"));
    }

    #[tokio::test]
    async fn test_cut_falls_back_to_bitstream_then_reencode() {
        // demuxer output fails once; the bitstream join writes the same file
        struct FailFirstJoin(Mutex<u32>, Mutex<Vec<CommandSpec>>);

        #[async_trait]
        impl ProcessRunner for FailFirstJoin {
            async fn run(
                &self,
                spec: &CommandSpec,
                _lines: Option<UnboundedSender<String>>,
                _cancel: &CancellationToken,
            ) -> Result<ProcessOutput, ProcessError> {
                self.1.lock().unwrap().push(spec.clone());
                if spec.arg_value("-f") == Some("concat") {
                    *self.0.lock().unwrap() += 1;
                    return Err(ProcessError::Exit {
                        program: "ffmpeg".into(),
                        code: Some(1),
                        tail: "Non-monotonous DTS".into(),
                    });
                }
                Ok(ProcessOutput::default())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FailFirstJoin(Mutex::new(0), Mutex::new(Vec::new())));
        let trimmer = SegmentTrimmer::new(runner.clone(), "ffmpeg");
        let method = trimmer
            .cut(
                &dir.path().join("in.mp4"),
                &[iv(0.0, 10.0), iv(30.0, 100.0)],
                &probe(),
                dir.path(),
                &dir.path().join("trimmed.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(method, CutMethod::BitstreamConcat);
        let seen = runner.1.lock().unwrap();
        assert!(seen.iter().any(|s| s.args.iter().any(|a| a.starts_with("concat:"))));

        // every copy path failing ends in a re-encode
        let (method, seen) = run_cut(vec!["part_1.mp4"], &[iv(0.0, 10.0), iv(30.0, 100.0)]).await;
        assert_eq!(method, CutMethod::Reencode);
        assert_eq!(seen.last().unwrap().arg_value("-c:v"), Some("libx264"));
    }

    #[tokio::test]
    async fn test_cut_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        struct Cancelled;

        #[async_trait]
        impl ProcessRunner for Cancelled {
            async fn run(
                &self,
                _spec: &CommandSpec,
                _lines: Option<UnboundedSender<String>>,
                _cancel: &CancellationToken,
            ) -> Result<ProcessOutput, ProcessError> {
                Err(ProcessError::Cancelled)
            }
        }

        let trimmer = SegmentTrimmer::new(Arc::new(Cancelled), "ffmpeg");
        let err = trimmer
            .cut(
                &dir.path().join("in.mp4"),
                &[iv(0.0, 10.0)],
                &probe(),
                dir.path(),
                &dir.path().join("out.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
