//! CLI entry point for the media fetch daemon
//!
//! `serve` runs the daemon and reads newline-delimited JSON requests from
//! stdin, `fetch` downloads one link, `check` runs the startup checks.

use clap::{ArgAction, Parser, Subcommand};
use media_fetch_daemon::{
    run_startup_checks, Config, Daemon, DaemonError, DeliverySink, JobRequest, LocalDirSink,
    Orchestrator, Quality, UserId,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// User id used for one-shot fetches
const LOCAL_USER: UserId = 0;

/// Media fetch daemon - queued, lock-guarded media downloads
#[derive(Parser, Debug)]
#[command(name = "media-fetchd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply if missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon, reading JSON requests from stdin
    Serve {
        /// Directory delivered files are copied into
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,

        /// Skip startup checks (yt-dlp, ffmpeg). For testing only.
        #[arg(long)]
        skip_checks: bool,
    },
    /// Download a single link and exit
    Fetch {
        url: String,

        /// Quality: auto, a ladder height like 720, "audio", or a format id
        #[arg(short, long, default_value = "auto")]
        quality: String,

        /// Extract audio only
        #[arg(long)]
        audio: bool,

        /// Cut sponsor segments (YouTube only)
        #[arg(long)]
        sponsor: bool,

        /// Keep the downloaded container as is
        #[arg(long)]
        raw: bool,

        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,

        #[arg(long)]
        skip_checks: bool,
    },
    /// Run the startup checks and exit
    Check,
}

/// One line of the stdin protocol
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Submit {
        user_id: UserId,
        url: String,
        #[serde(default)]
        quality: Option<String>,
        #[serde(default)]
        audio: bool,
        #[serde(default)]
        sponsor: bool,
        #[serde(default)]
        sponsor_categories: Vec<String>,
        #[serde(default)]
        raw: bool,
        #[serde(default)]
        hls: bool,
        #[serde(default)]
        source_url: Option<String>,
        #[serde(default)]
        external_audio: Option<String>,
    },
    Menu {
        user_id: UserId,
        url: String,
        #[serde(default)]
        source_url: Option<String>,
    },
    Choose {
        user_id: UserId,
        key: String,
        quality: String,
    },
    Cancel {
        user_id: UserId,
    },
    Status,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum Reply {
    Queued { job_id: String },
    Menu { user_id: UserId, url: String, key: String, title: Option<String>, options: Vec<String> },
    MenuRefused { user_id: UserId, url: String, reason: String },
    Cancelled {
        removed_pending: usize,
        cancel_requested_active: usize,
        remaining_active: usize,
        cancelled_selections: usize,
    },
    Status { pending: usize, active: usize, selections: usize },
    Refused { reason: String },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn load_config(path: &Path) -> Result<Config, DaemonError> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    warn!(path = %path.display(), "config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn build_daemon(config: Config, out: PathBuf, skip_checks: bool) -> Result<Daemon, DaemonError> {
    let sink: Arc<dyn DeliverySink> = Arc::new(LocalDirSink::new(out));
    if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config, sink)
    } else {
        Daemon::with_config(config, sink)
    }
}

async fn handle(orchestrator: &Orchestrator, request: Request) -> Reply {
    let refused = |e: &dyn std::fmt::Display| Reply::Refused {
        reason: e.to_string(),
    };
    match request {
        Request::Submit {
            user_id,
            url,
            quality,
            audio,
            sponsor,
            sponsor_categories,
            raw,
            hls,
            source_url,
            external_audio,
        } => {
            let mut job = JobRequest::new(user_id, url);
            job.quality = quality.as_deref().map(Quality::parse).unwrap_or(Quality::Auto);
            job.force_audio = audio;
            job.sponsor_trim = sponsor;
            job.sponsor_categories = sponsor_categories;
            job.raw_format = raw;
            job.force_hls = hls;
            job.source_url = source_url;
            job.external_audio = external_audio;
            match orchestrator.submit(job) {
                Ok(id) => Reply::Queued {
                    job_id: id.to_string(),
                },
                Err(e) => refused(&e),
            }
        }
        Request::Menu {
            user_id,
            url,
            source_url,
        } => match orchestrator.prepare_selection(user_id, &url, source_url).await {
            Ok(menu) => Reply::Menu {
                user_id,
                url,
                key: menu.key,
                title: menu.title,
                options: menu.options.iter().map(ToString::to_string).collect(),
            },
            Err(e) => Reply::MenuRefused {
                user_id,
                url,
                reason: e.to_string(),
            },
        },
        Request::Choose {
            user_id,
            key,
            quality,
        } => match orchestrator.confirm_selection(&key, user_id, Quality::parse(&quality)) {
            Ok(id) => Reply::Queued {
                job_id: id.to_string(),
            },
            Err(e) => refused(&e),
        },
        Request::Cancel { user_id } => {
            let summary = orchestrator.cancel_user_jobs(user_id);
            Reply::Cancelled {
                removed_pending: summary.removed_pending,
                cancel_requested_active: summary.cancel_requested_active,
                remaining_active: summary.remaining_active,
                cancelled_selections: summary.cancelled_selections,
            }
        }
        Request::Status => Reply::Status {
            pending: orchestrator.pending_count(),
            active: orchestrator.active_count(),
            selections: orchestrator.pending_selections(),
        },
    }
}

fn print_reply(reply: &Reply) {
    match serde_json::to_string(reply) {
        Ok(line) => println!("{}", line),
        Err(e) => error!(error = %e, "could not encode reply"),
    }
}

async fn serve(daemon: Daemon) -> ExitCode {
    let _tasks = daemon.start_background_tasks();
    let orchestrator = daemon.orchestrator();
    info!(bind = %daemon.config.server.bind, "serving; reading requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Request>(&line) {
                    // menus resolve metadata; answer them off the read loop
                    Ok(request @ Request::Menu { .. }) => {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move {
                            print_reply(&handle(&orchestrator, request).await);
                        });
                    }
                    Ok(request) => print_reply(&handle(&orchestrator, request).await),
                    Err(e) => print_reply(&Reply::Refused { reason: format!("bad request: {}", e) }),
                },
                Ok(None) => {
                    info!("stdin closed, waiting for running jobs");
                    orchestrator.idle().await;
                    return ExitCode::SUCCESS;
                }
                Err(e) => {
                    error!(error = %e, "reading stdin failed");
                    daemon.shutdown().await;
                    return ExitCode::FAILURE;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                daemon.shutdown().await;
                return ExitCode::SUCCESS;
            }
        }
    }
}

async fn fetch(daemon: Daemon, request: JobRequest) -> ExitCode {
    let orchestrator = daemon.orchestrator();
    if let Err(e) = orchestrator.submit(request) {
        error!(error = %e, "submission refused");
        return ExitCode::FAILURE;
    }
    tokio::select! {
        _ = orchestrator.idle() => {}
        _ = tokio::signal::ctrl_c() => daemon.shutdown().await,
    }
    let outcomes = orchestrator.outcome_counts();
    if outcomes.completed == 1 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Check => match run_startup_checks(&config) {
            Ok(versions) => {
                println!("yt-dlp {}", versions.ytdlp);
                println!("ffmpeg major version {}", versions.ffmpeg_major);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "startup check failed");
                ExitCode::FAILURE
            }
        },
        Command::Serve { out, skip_checks } => match build_daemon(config, out, skip_checks) {
            Ok(daemon) => serve(daemon).await,
            Err(e) => {
                error!(error = %e, "failed to initialize daemon");
                ExitCode::FAILURE
            }
        },
        Command::Fetch {
            url,
            quality,
            audio,
            sponsor,
            raw,
            out,
            skip_checks,
        } => {
            let mut request = JobRequest::new(LOCAL_USER, url);
            request.quality = Quality::parse(&quality);
            request.force_audio = audio;
            request.sponsor_trim = sponsor;
            request.raw_format = raw;
            match build_daemon(config, out, skip_checks) {
                Ok(daemon) => fetch(daemon, request).await,
                Err(e) => {
                    error!(error = %e, "failed to initialize daemon");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
