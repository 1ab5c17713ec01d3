// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Monitored process execution.
//!
//! [`ProcessSandbox`] runs the command in its own process group with a
//! cleared environment. Accesses are observed by snapshotting every
//! reported manifest scope before and after the run, which catches every
//! write to a declared output or output directory but no reads.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::{diff, snapshot, ReportedFileAccess};
use crate::error::{Result, SandboxError};
use crate::policy::FileAccessManifest;

pub const DEFAULT_OUTPUT_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct SandboxedProcessInfo {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// The complete environment of the process
    pub environment: Vec<(String, String)>,
    pub manifest: FileAccessManifest,
    pub timeout: Duration,
    /// Bytes of stdout and of stderr kept; the rest is drained and dropped
    pub output_capture_bytes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

#[derive(Clone, Debug)]
pub struct SandboxedProcessResult {
    pub status: ProcessStatus,
    /// Exit code, or 128 + signal number when the process was killed
    pub exit_code: i32,
    pub file_accesses: Vec<ReportedFileAccess>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, info: SandboxedProcessInfo, cancel: CancellationToken) -> Result<SandboxedProcessResult>;
}

#[derive(Clone, Debug, Default)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, info: SandboxedProcessInfo, cancel: CancellationToken) -> Result<SandboxedProcessResult> {
        if info.executable.as_os_str().is_empty() {
            return Err(SandboxError::InvalidCommand("empty executable path".into()));
        }

        let table = info.manifest.path_table().clone();
        let roots: Vec<PathBuf> = info.manifest.reported_scopes().map(|p| table.to_path_buf(p)).collect();
        let before = snapshot_blocking(roots.clone()).await?;

        let mut command = Command::new(&info.executable);
        command
            .args(&info.arguments)
            .current_dir(&info.working_directory)
            .env_clear()
            .envs(info.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            executable: info.executable.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Monitoring("child exited before its pid was read".into()))?;
        info!(
            operation = "sandbox_run",
            pid,
            executable = %info.executable.display(),
            timeout_ms = info.timeout.as_millis() as u64,
            "process started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Monitoring("stdout pipe missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Monitoring("stderr pipe missing".into()))?;
        let stdout_task = tokio::spawn(capture(stdout, info.output_capture_bytes));
        let stderr_task = tokio::spawn(capture(stderr, info.output_capture_bytes));

        let (status, exit) = tokio::select! {
            exit = child.wait() => (ProcessStatus::Exited, exit),
            _ = tokio::time::sleep(info.timeout) => {
                warn!(operation = "sandbox_run", pid, "process timed out");
                kill_group(pid);
                (ProcessStatus::TimedOut, child.wait().await)
            }
            _ = cancel.cancelled() => {
                info!(operation = "sandbox_run", pid, "process cancelled");
                kill_group(pid);
                (ProcessStatus::Cancelled, child.wait().await)
            }
        };
        let exit = exit.map_err(|e| SandboxError::Monitoring(format!("waiting for process {pid}: {e}")))?;
        // Surviving descendants in the group would hold the pipes open.
        kill_group(pid);
        let duration = started.elapsed();

        let stdout = join_capture(stdout_task).await?;
        let stderr = join_capture(stderr_task).await?;
        let exit_code = exit
            .code()
            .unwrap_or_else(|| 128 + exit.signal().unwrap_or_default());

        let after = snapshot_blocking(roots).await?;
        let file_accesses: Vec<ReportedFileAccess> = diff(&before, &after)
            .into_iter()
            .map(|(path, requested_access)| ReportedFileAccess {
                manifest_path: path
                    .to_str()
                    .and_then(|text| table.get(text))
                    .unwrap_or_default(),
                path,
                requested_access,
            })
            .collect();

        debug!(
            operation = "sandbox_run",
            pid,
            exit_code,
            ?status,
            accesses = file_accesses.len(),
            duration_ms = duration.as_millis() as u64,
            "process finished"
        );
        Ok(SandboxedProcessResult {
            status,
            exit_code,
            file_accesses,
            stdout,
            stderr,
            duration,
        })
    }
}

fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(operation = "sandbox_kill", pid, error = %e, "failed to kill process group"),
    }
}

async fn snapshot_blocking(
    roots: Vec<PathBuf>,
) -> Result<std::collections::HashMap<PathBuf, crate::access::FileStamp>> {
    tokio::task::spawn_blocking(move || snapshot(&roots))
        .await
        .map_err(|e| SandboxError::Monitoring(format!("access snapshot failed: {e}")))
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<CapturedOutput> {
    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(bytes.len());
        bytes.extend_from_slice(&buf[..n.min(room)]);
        truncated |= n > room;
    }
    Ok(CapturedOutput { bytes, truncated })
}

async fn join_capture(task: tokio::task::JoinHandle<std::io::Result<CapturedOutput>>) -> Result<CapturedOutput> {
    task.await
        .map_err(|e| SandboxError::Monitoring(format!("output capture task failed: {e}")))?
        .map_err(|e| SandboxError::Monitoring(format!("reading process output: {e}")))
}
