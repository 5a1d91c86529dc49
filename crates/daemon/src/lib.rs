//! Media fetch daemon
//!
//! Background service that admits download requests, runs them through the
//! download pipeline on a bounded queue, and hands the results to a
//! delivery sink.

pub mod attempts;
pub mod classify;
pub mod concurrency;
pub mod cooldown;
pub mod daemon;
pub mod direct;
pub mod encode;
pub mod error;
pub mod extractor;
pub mod finalize;
pub mod formats;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod progress;
pub mod queue;
pub mod request_cache;
pub mod resolver;
pub mod sink;
pub mod size_gate;
pub mod sponsor;
pub mod startup;
pub mod url_lock;

pub use media_fetch_config as config;
pub use media_fetch_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use cooldown::CooldownTracker;
pub use daemon::{default_deps, write_snapshot, Daemon, DaemonError};
pub use error::{ErrorKind, PipelineError};
pub use extractor::{DownloadRequest, Extractor, YtDlpExtractor};
pub use formats::{MediaInfo, Quality};
pub use jobs::{JobId, JobOutcome, JobStage, JobState, JobView};
pub use metrics::{collect_system_metrics, new_shared_activity, ActivitySnapshot, SharedActivity, SystemMetrics};
pub use metrics_server::{create_activity_router, run_activity_server, ServerError};
pub use orchestrator::{CancelSummary, Orchestrator, SubmitError};
pub use pipeline::{JobContext, JobRequest, Pipeline, PipelineDeps, PipelineOutput, PipelineSettings};
pub use process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use sink::{DeliveryMeta, DeliveryMode, DeliverySink, DeliveryTarget, LocalDirSink, SinkError};
pub use sponsor::{HttpSegmentProvider, Interval, SegmentProvider};
pub use startup::{run_startup_checks, StartupError, ToolVersions};
pub use url_lock::{BlockReason, UrlLockManager, UserId};
