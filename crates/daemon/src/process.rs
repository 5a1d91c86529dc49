//! External process execution.
//!
//! The extractor and the transcoder are always driven through the
//! [`ProcessRunner`] trait so the pipeline can be exercised with scripted
//! fakes. The tokio implementation streams output lines to an optional
//! channel, keeps the tail of stderr for error classification, and kills the
//! child when the job's cancellation token fires.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Error type for process execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully
    #[error("{program} exited with code {code:?}")]
    Exit {
        program: String,
        code: Option<i32>,
        tail: String,
    },

    /// The cancellation token fired and the child was killed
    #[error("Process cancelled")]
    Cancelled,

    /// IO error while waiting for the child
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for PipelineError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Cancelled => PipelineError::cancelled(),
            ProcessError::Exit {
                program,
                code,
                tail,
            } => {
                if tail.trim().is_empty() {
                    PipelineError::fatal(format!("{} exited with code {:?}", program, code))
                } else {
                    PipelineError::from_tool_output(&program, &tail)
                }
            }
            other => PipelineError::fatal(other.to_string()),
        }
    }
}

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Short program name for messages (`/usr/bin/yt-dlp` -> `yt-dlp`)
    pub fn tool_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `flag`, if present
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

/// Output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr_tail: String,
}

/// Runs external commands.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion.
    ///
    /// Every stdout and stderr line is forwarded to `lines` when given.
    /// Firing `cancel` terminates the child and yields
    /// [`ProcessError::Cancelled`].
    async fn run(
        &self,
        spec: &CommandSpec,
        lines: Option<UnboundedSender<String>>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        lines: Option<UnboundedSender<String>>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        debug!(program = %spec.program, args = ?spec.args, "spawning process");
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.tool_name(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(collect_stdout(stdout, lines.clone()));
        let stderr_task = tokio::spawn(collect_tail(stderr, lines));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(program = %spec.program, error = %e, "failed to kill cancelled process");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(ProcessError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(ProcessOutput {
                stdout,
                stderr_tail,
            })
        } else {
            Err(ProcessError::Exit {
                program: spec.tool_name(),
                code: status.code(),
                tail: stderr_tail,
            })
        }
    }
}

async fn collect_stdout<R>(reader: Option<R>, lines: Option<UnboundedSender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut out = String::new();
    let Some(reader) = reader else {
        return out;
    };
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Some(tx) = &lines {
            let _ = tx.send(line.clone());
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

async fn collect_tail<R>(reader: Option<R>, lines: Option<UnboundedSender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Some(tx) = &lines {
            let _ = tx.send(line.clone());
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}
