//! External command execution
//!
//! Everything Fleetdeck knows about the outside world comes from
//! external tools (`ping`, `hyprctl`, `systemctl`, the fleet script).
//! The runner trait keeps that seam injectable so tests can substitute
//! scripted output for real binaries.

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of one external command
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Runs an external command with a bounded wait.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> BoxFuture<'static, Result<CmdOutput>>;
}

/// Runner backed by real processes.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> BoxFuture<'static, Result<CmdOutput>> {
        let program = program.to_string();
        let args = args.to_vec();
        Box::pin(async move {
            let child = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::SpawnFailed(format!("{}: {}", program, e)))?;

            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| Error::CommandTimeout {
                    seconds: timeout.as_secs(),
                })??;

            Ok(CmdOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
