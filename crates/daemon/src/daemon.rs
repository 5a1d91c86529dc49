//! Daemon startup and background tasks for the media fetch daemon
//!
//! Wires the real collaborators into an [`Orchestrator`] and runs the
//! activity server, the snapshot refresher and writer, and the selection
//! sweeper.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::cooldown::CooldownTracker;
use crate::direct::DirectFetcher;
use crate::error::PipelineError;
use crate::extractor::YtDlpExtractor;
use crate::metrics::{collect_system_metrics, new_shared_activity, ActivitySnapshot, SharedActivity};
use crate::metrics_server::run_activity_server;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{Pipeline, PipelineDeps, PipelineSettings};
use crate::process::{ProcessRunner, TokioProcessRunner};
use crate::resolver::{PageMediaResolver, ResolverChain};
use crate::sink::DeliverySink;
use crate::sponsor::HttpSegmentProvider;
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How often the in-memory activity snapshot is refreshed
const ACTIVITY_REFRESH: Duration = Duration::from_secs(1);

/// How often expired selections are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// A collaborator could not be constructed
    #[error("Initialization error: {0}")]
    Init(#[from] PipelineError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    orchestrator: Arc<Orchestrator>,
    activity: SharedActivity,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the config, applies environment overrides, runs the startup
    /// checks and wires the collaborators.
    pub async fn new<P: AsRef<Path>>(
        config_path: P,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, sink)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config, sink: Arc<dyn DeliverySink>) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config, sink)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when yt-dlp and ffmpeg are not installed.
    pub fn new_without_checks(
        config: Config,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, DaemonError> {
        let deps = default_deps(&config, sink)?;
        Ok(Self::with_deps(config, deps))
    }

    /// Initialize the daemon around caller-supplied collaborators
    pub fn with_deps(config: Config, deps: PipelineDeps) -> Self {
        let concurrency_plan = derive_plan(&config);
        let pipeline = Pipeline::new(deps, PipelineSettings::from_config(&config));
        let orchestrator = Arc::new(Orchestrator::new(
            concurrency_plan,
            pipeline,
            Duration::from_secs(config.selection.ttl_secs),
        ));
        info!(
            max_global_tasks = concurrency_plan.max_global_tasks,
            max_user_urls = concurrency_plan.max_user_urls,
            queue_concurrency = concurrency_plan.queue_concurrency,
            "daemon initialized"
        );
        Self {
            config,
            concurrency_plan,
            orchestrator,
            activity: new_shared_activity(),
        }
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn activity(&self) -> SharedActivity {
        self.activity.clone()
    }

    /// Start the activity HTTP server
    pub fn start_activity_server(&self) -> tokio::task::JoinHandle<()> {
        let activity = self.activity.clone();
        let bind = self.config.server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_activity_server(activity, &bind).await {
                error!(error = %e, "activity server stopped");
            }
        })
    }

    /// Periodically refresh the shared activity snapshot
    pub fn start_activity_updater(&self) -> tokio::task::JoinHandle<()> {
        let activity = self.activity.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = ActivitySnapshot::capture(&orchestrator, collect_system_metrics());
                *activity.write().await = snapshot;
                tokio::time::sleep(ACTIVITY_REFRESH).await;
            }
        })
    }

    /// Periodically write the snapshot to `storage.activity_snapshot_path`
    ///
    /// Returns `None` when no path is configured.
    pub fn start_snapshot_writer(&self) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.config.storage.activity_snapshot_path.clone()?;
        let interval = Duration::from_secs(self.config.storage.snapshot_interval_secs.max(1));
        let activity = self.activity.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = activity.read().await.clone();
                if let Err(e) = write_snapshot(&path, &snapshot).await {
                    warn!(path = %path.display(), error = %e, "snapshot write failed");
                }
            }
        }))
    }

    /// Periodically release reservations of unconfirmed selections
    pub fn start_selection_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                orchestrator.sweep_expired();
            }
        })
    }

    /// Start every background task
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![
            self.start_activity_server(),
            self.start_activity_updater(),
            self.start_selection_sweeper(),
        ];
        handles.extend(self.start_snapshot_writer());
        handles
    }

    /// Cancel every job and wait until all of them are torn down
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.orchestrator.cancel_all();
        self.orchestrator.idle().await;
        debug!("all jobs released");
    }
}

/// Production collaborators for `config`
pub fn default_deps(
    config: &Config,
    sink: Arc<dyn DeliverySink>,
) -> Result<PipelineDeps, DaemonError> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let extractor = Arc::new(YtDlpExtractor::new(
        runner.clone(),
        &config.tools.ytdlp_path,
        &config.tools.ffmpeg_path,
    ));
    let segments = Arc::new(HttpSegmentProvider::new(
        &config.sponsor.api_base,
        config.sponsor.max_attempts,
    )?);
    let mut resolvers = ResolverChain::new();
    if !config.network.page_resolver_hosts.is_empty() {
        resolvers = resolvers.with(Arc::new(PageMediaResolver::new(
            config.network.page_resolver_hosts.clone(),
        )?));
    }
    let direct = Arc::new(DirectFetcher::new(config.network.proxy.as_deref())?);

    Ok(PipelineDeps {
        extractor,
        runner,
        sink,
        segments,
        resolvers,
        direct: Some(direct),
        cooldown: Arc::new(CooldownTracker::new()),
    })
}

/// Write `snapshot` as JSON next to `path`, then rename it into place
pub async fn write_snapshot(path: &Path, snapshot: &ActivitySnapshot) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await
}
