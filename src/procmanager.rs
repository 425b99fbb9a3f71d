//! External process execution.
//!
//! The scanner only talks to [`ProcessExecutor`]. Whether commands really run
//! is decided once, when the executor is created.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, ScanError};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, or -1 if the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Runs `cmd` with `args`, in `cwd` when given, and waits for it.
    ///
    /// A non-zero exit is not an error here; callers decide what it means.
    /// Dropping the returned future terminates the process.
    async fn run(&self, cmd: &str, args: &[String], cwd: Option<&Path>) -> Result<ProcessOutput>;
}

/// Runs commands for real.
pub struct ProcManager;

#[async_trait]
impl ProcessExecutor for ProcManager {
    async fn run(&self, cmd: &str, args: &[String], cwd: Option<&Path>) -> Result<ProcessOutput> {
        debug!(command = %command_line(cmd, args), cwd = ?cwd, "Running");

        let mut command = Command::new(cmd);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| ScanError::ProcessExecutionFailed {
                command: command_line(cmd, args),
                exit_code: -1,
                stderr: e.to_string(),
            })?;

        let result = ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = cmd, exit_code = result.exit_code, "Finished");
        Ok(result)
    }
}

/// Logs commands instead of running them and reports success.
pub struct DryRunExecutor;

#[async_trait]
impl ProcessExecutor for DryRunExecutor {
    async fn run(&self, cmd: &str, args: &[String], cwd: Option<&Path>) -> Result<ProcessOutput> {
        info!(command = %command_line(cmd, args), cwd = ?cwd, "[dry-run] Skipping");
        Ok(ProcessOutput::default())
    }
}

/// Picks the executor for this invocation.
pub fn new(dry_run: bool) -> Arc<dyn ProcessExecutor> {
    if dry_run {
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(ProcManager)
    }
}

/// Renders a command for logs and error messages.
pub fn command_line(cmd: &str, args: &[String]) -> String {
    std::iter::once(cmd)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
