//! Process execution and signal delivery for orbit-node.
//!
//! Single-shot invocations of the sing-box binary (`check`, `version`)
//! run through [`run_capture`]; the long-running `run` child is spawned
//! by the supervisor directly, which uses [`send_signal`] for reload and
//! shutdown signalling.
//!
//! # Example
//!
//! ```ignore
//! use orbit_process::run_capture;
//!
//! let capture = run_capture("sing-box", &["version"], None, None).await?;
//! assert!(capture.success());
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

pub use nix::sys::signal::Signal;

/// Result of a single-shot command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCapture {
    /// Exit code (or -1 when terminated by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the timeout and was killed.
    pub timed_out: bool,
    /// Total wall-clock duration.
    pub duration: Duration,
}

impl CommandCapture {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// With a `timeout`, the child is killed once the deadline passes and
/// the capture reports `timed_out = true` with exit code -1.
pub async fn run_capture(
    program: &Path,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<CommandCapture> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    command.kill_on_drop(true);

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {} {:?}", program.display(), args))?;

    let output = match timeout {
        None => child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to run command: {}", program.display()))?,
        Some(limit) => {
            match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output
                    .with_context(|| format!("failed to run command: {}", program.display()))?,
                Err(_) => {
                    // kill_on_drop reaps the child when the future is dropped.
                    return Ok(CommandCapture {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: format!(
                            "{} timed out after {}",
                            program.display(),
                            humantime::format_duration(limit)
                        ),
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
            }
        }
    };

    Ok(CommandCapture {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        timed_out: false,
        duration: start.elapsed(),
    })
}

/// Deliver a signal to a process by pid.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let pid = nix::unistd::Pid::from_raw(
        i32::try_from(pid).with_context(|| format!("pid {} out of range", pid))?,
    );
    nix::sys::signal::kill(pid, signal)
        .with_context(|| format!("failed to send {} to pid {}", signal, pid))
}

/// Resolve a binary setting to an invocable path.
///
/// Paths with a directory component must exist on disk; bare names are
/// looked up on `PATH`.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf> {
    if binary.components().count() > 1 {
        if binary.exists() {
            return Ok(binary.to_path_buf());
        }
        anyhow::bail!("binary not found at {}", binary.display());
    }
    which::which(binary)
        .with_context(|| format!("binary '{}' not found on PATH", binary.display()))
}
