//! External process execution.
//!
//! Every collaborator of vmrun (`ssh`, `rsync`, `vboxmanage`, package
//! managers, ...) is reached through a [`CommandRunner`]. The production
//! implementation is [`SystemRunner`]; tests use
//! [`FakeRunner`](crate::fakes::FakeRunner).

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, VmError};

/// What a failing command means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// A non-zero exit aborts the run.
    Fatal,
    /// A non-zero exit is logged and the run continues.
    BestEffort,
}

/// A single external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, passed verbatim (no shell).
    pub args: Vec<String>,

    /// Text written to the child's stdin, which is then closed.
    pub stdin: Option<String>,

    /// Capture stdout/stderr instead of streaming them to the job log.
    pub capture: bool,

    /// Timeout in seconds (0 = wait forever).
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            capture: false,
            timeout_secs: 0,
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

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Space-joined command line, for logs and test matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal or never started).
    pub exit_code: i32,

    /// Captured stdout (empty unless `capture` was set).
    pub stdout: String,

    /// Captured stderr (empty unless `capture` was set).
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn into_error(self, spec: &CommandSpec) -> VmError {
        VmError::CommandFailed {
            program: spec.program.clone(),
            code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Seam over process execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Only spawn failures and timeouts are
    /// errors; a non-zero exit is reported through [`CommandOutput`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run the command and apply `policy` to its outcome.
    ///
    /// Under [`FailurePolicy::BestEffort`] nothing is an error: spawn
    /// failures come back as an output with exit code -1.
    async fn run_with(&self, spec: &CommandSpec, policy: FailurePolicy) -> Result<CommandOutput> {
        let outcome = self.run(spec).await;
        match (outcome, policy) {
            (Ok(out), _) if out.success() => Ok(out),
            (Ok(out), FailurePolicy::Fatal) => Err(out.into_error(spec)),
            (Err(e), FailurePolicy::Fatal) => Err(e),
            (Ok(out), FailurePolicy::BestEffort) => {
                warn!(command = %spec.command_line(), exit_code = out.exit_code, "best-effort command failed, continuing");
                Ok(out)
            }
            (Err(e), FailurePolicy::BestEffort) => {
                warn!(command = %spec.command_line(), error = %e, "best-effort command could not run, continuing");
                Ok(CommandOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: 0,
                })
            }
        }
    }
}

/// Runs commands on the host with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();
        debug!(command = %spec.command_line(), "exec");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);
        if spec.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|source| VmError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| VmError::Timeout {
                program: spec.program.clone(),
                secs: spec.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_args() {
        let spec = CommandSpec::new("ssh")
            .args(["-o", "StrictHostKeyChecking=no"])
            .arg("freebsd");
        assert_eq!(spec.command_line(), "ssh -o StrictHostKeyChecking=no freebsd");
        assert!(!spec.capture);
        assert_eq!(spec.timeout_secs, 0);
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let spec = CommandSpec::new("echo").arg("hello").captured();
        let out = SystemRunner.run(&spec).await.expect("echo runs");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let spec = CommandSpec::new("cat").stdin("from stdin").captured();
        let out = SystemRunner.run(&spec).await.expect("cat runs");
        assert_eq!(out.stdout, "from stdin");
    }

    #[tokio::test]
    async fn test_fatal_policy_turns_exit_into_error() {
        let spec = CommandSpec::new("false").captured();
        let err = SystemRunner
            .run_with(&spec, FailurePolicy::Fatal)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::CommandFailed { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_exit_and_spawn_failures() {
        let out = SystemRunner
            .run_with(&CommandSpec::new("false"), FailurePolicy::BestEffort)
            .await
            .expect("best effort never errors");
        assert!(!out.success());

        let out = SystemRunner
            .run_with(
                &CommandSpec::new("definitely-not-a-real-binary-vmrun"),
                FailurePolicy::BestEffort,
            )
            .await
            .expect("best effort never errors");
        assert_eq!(out.exit_code, -1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal_error() {
        let err = SystemRunner
            .run(&CommandSpec::new("definitely-not-a-real-binary-vmrun"))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let spec = CommandSpec::new("sleep").arg("5").timeout(1);
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, VmError::Timeout { secs: 1, .. }));
    }
}
