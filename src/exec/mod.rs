//! Exec - Subprocess Capability
//!
//! ## Responsibilities
//!
//! - Run external tools (losetup, rsync, tesla-control, ...) to completion
//!   with captured output
//! - Stream long-lived process output line by line (dmesg -w)
//! - Kill children on daemon shutdown via the root cancellation token
//!
//! The daemon is mostly a subprocess driver, so every component takes the
//! capability as `Arc<dyn Exec>` and tests substitute a scripted fake that
//! returns canned exit codes and output.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
pub mod script;

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed, for log and match purposes
    pub fn combined(&self) -> String {
        let mut s = String::new();
        s.push_str(self.stdout.trim());
        if !self.stderr.trim().is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str(self.stderr.trim());
        }
        s
    }
}

/// Line-by-line reader over a streaming subprocess
///
/// Holds the child handle so dropping the stream kills the process
/// (`kill_on_drop`).
pub struct LineStream {
    inner: LineStreamInner,
}

enum LineStreamInner {
    Child {
        lines: Lines<BufReader<ChildStdout>>,
        _child: Child,
    },
    #[cfg(test)]
    Scripted { lines: std::vec::IntoIter<String> },
}

impl LineStream {
    /// Next stdout line, `None` when the process closes its output
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        match &mut self.inner {
            LineStreamInner::Child { lines, .. } => Ok(lines.next_line().await?),
            #[cfg(test)]
            LineStreamInner::Scripted { lines } => Ok(lines.next()),
        }
    }

    #[cfg(test)]
    pub(crate) fn scripted(lines: Vec<String>) -> Self {
        Self {
            inner: LineStreamInner::Scripted {
                lines: lines.into_iter(),
            },
        }
    }
}

/// Subprocess capability
#[async_trait]
pub trait Exec: Send + Sync {
    /// Run to completion, capturing stdout and stderr.
    ///
    /// A non-zero exit is NOT an error here; callers apply their own exit
    /// code policy via [`CommandOutput`]. Spawn failure maps to `Error::Io`,
    /// shutdown to `Error::Cancelled`.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run to completion with `stdin` fed to the child.
    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &str,
    ) -> Result<CommandOutput>;

    /// Spawn a long-lived process and stream its stdout lines.
    async fn stream_lines(&self, program: &str, args: &[&str]) -> Result<LineStream>;
}

/// Real subprocess driver
///
/// Every child is spawned with `kill_on_drop(true)`; on cancellation the
/// in-flight wait future is dropped, which sends SIGKILL to the child, and
/// the caller observes `Error::Cancelled`.
pub struct SystemExec {
    cancel: CancellationToken,
}

impl SystemExec {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    async fn run_inner(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                drop(pipe);
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(program = %program, "Subprocess cancelled by shutdown");
                Err(Error::Cancelled)
            }
            result = child.wait_with_output() => {
                let output = result?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

#[async_trait]
impl Exec for SystemExec {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_inner(program, args, None).await
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &str,
    ) -> Result<CommandOutput> {
        self.run_inner(program, args, Some(stdin)).await
    }

    async fn stream_lines(&self, program: &str, args: &[&str]) -> Result<LineStream> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("no stdout pipe")))?;

        Ok(LineStream {
            inner: LineStreamInner::Child {
                lines: BufReader::new(stdout).lines(),
                _child: child,
            },
        })
    }
}
