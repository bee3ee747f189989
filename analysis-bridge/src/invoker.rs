//! Spawns one analysis worker per request and captures its two output
//! channels separately.
//!
//! stdout is the primary channel and carries the single result message.
//! stderr is the secondary channel and carries free-form diagnostics, which
//! are kept alongside the result but never parsed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_QUERY};
use crate::environment::ReadyEnvironment;
use crate::error::SpawnError;

const CAPTURE_CHUNK_BYTES: usize = 8192;

/// One analysis request: which document, and what to ask about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub document_path: PathBuf,
    pub query: String,
}

impl AnalysisRequest {
    pub fn new(document_path: impl Into<PathBuf>) -> Self {
        Self {
            document_path: document_path.into(),
            query: DEFAULT_QUERY.to_string(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }
}

/// Everything the worker produced, frozen once it has exited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the output bound was hit and later bytes were discarded.
    pub truncated: bool,
}

impl RawOutput {
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Byte budget shared by both capture tasks of one invocation.
struct OutputBudget {
    remaining: AtomicUsize,
    exhausted: AtomicBool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Reserve up to `wanted` bytes and return how many were granted.
    fn claim(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                granted = remaining.min(wanted);
                Some(remaining - granted)
            });
        if granted < wanted {
            self.exhausted.store(true, Ordering::Release);
        }
        granted
    }

    fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Primary,
    Secondary,
}

/// Launches worker processes and collects their output.
#[derive(Debug, Clone)]
pub struct WorkerInvoker {
    max_output_bytes: usize,
    timeout: Option<Duration>,
}

impl Default for WorkerInvoker {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            timeout: None,
        }
    }
}

impl WorkerInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_bytes,
            timeout: config.timeout,
        }
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the worker to completion for `request`.
    ///
    /// Resolves once the process has exited and both channels have been read
    /// to EOF. A non-zero exit is not an error here; the exit code is
    /// reported in [`RawOutput`] and left for the caller to judge. The
    /// process is killed if `cancel` fires or the configured timeout elapses.
    pub async fn invoke(
        &self,
        env: &ReadyEnvironment,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SpawnError> {
        info!(
            document = %request.document_path.display(),
            executable = %env.executable,
            "Starting analysis worker"
        );

        let mut command = Command::new(&env.executable);
        command
            .args(&env.interpreter_args)
            .arg(&env.script)
            .arg(&request.document_path)
            .arg(&request.query)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SpawnError::Start {
            program: env.executable.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(?pid, "Worker process spawned");

        let budget = Arc::new(OutputBudget::new(self.max_output_bytes));
        let mut stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(capture(stdout, budget.clone(), Channel::Primary)));
        let mut stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(capture(stderr, budget.clone(), Channel::Secondary)));

        // The deadline covers draining too: a grandchild holding the pipes
        // open must not keep the call alive after the worker itself exits.
        let finished = tokio::select! {
            result = wait_and_drain(&mut child, &mut stdout_task, &mut stderr_task) => result,
            _ = cancel.cancelled() => {
                warn!(?pid, "Worker cancelled, killing process");
                terminate(&mut child, &stdout_task, &stderr_task).await;
                return Err(SpawnError::Cancelled);
            }
            _ = deadline(self.timeout) => {
                let elapsed = self.timeout.unwrap_or_default();
                warn!(?pid, ?elapsed, "Worker timed out, killing process");
                terminate(&mut child, &stdout_task, &stderr_task).await;
                return Err(SpawnError::Timeout(elapsed));
            }
        };

        let (status, stdout, stderr) = match finished {
            Ok(finished) => finished,
            Err(e) => {
                terminate(&mut child, &stdout_task, &stderr_task).await;
                return Err(e);
            }
        };
        let truncated = budget.exhausted();
        if truncated {
            warn!(
                limit = self.max_output_bytes,
                "Worker output exceeded the capture limit and was truncated"
            );
        }

        let output = RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            signal: exit_signal(&status),
            truncated,
        };

        info!(
            ?pid,
            exit_code = ?output.exit_code,
            signal = ?output.signal,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Analysis worker exited"
        );

        Ok(output)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

type CaptureTask = JoinHandle<std::io::Result<Vec<u8>>>;

async fn wait_and_drain(
    child: &mut Child,
    stdout_task: &mut Option<CaptureTask>,
    stderr_task: &mut Option<CaptureTask>,
) -> Result<(ExitStatus, Vec<u8>, Vec<u8>), SpawnError> {
    let status = child.wait().await?;
    let stdout = join_capture(stdout_task.as_mut()).await?;
    let stderr = join_capture(stderr_task.as_mut()).await?;
    Ok((status, stdout, stderr))
}

async fn terminate(
    child: &mut Child,
    stdout_task: &Option<CaptureTask>,
    stderr_task: &Option<CaptureTask>,
) {
    match child.kill().await {
        Ok(()) => {}
        // Already reaped; only the pipes were still open.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => warn!(error = %e, "Failed to kill worker process"),
    }
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        task.abort();
    }
}

async fn join_capture(task: Option<&mut CaptureTask>) -> Result<Vec<u8>, SpawnError> {
    match task {
        Some(task) => task
            .await
            .map_err(|e| SpawnError::Io(std::io::Error::other(e)))?
            .map_err(SpawnError::Io),
        None => Ok(Vec::new()),
    }
}

/// Read one channel to EOF in fixed-size chunks, keeping bytes while the
/// shared budget allows. Bytes past the budget are still read so the worker
/// never blocks on a full pipe, but they are never buffered.
async fn capture<R>(
    mut reader: R,
    budget: Arc<OutputBudget>,
    channel: Channel,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CAPTURE_CHUNK_BYTES];
    let mut captured = Vec::new();
    // Start of the secondary channel's current, unfinished line.
    let mut line_start = 0;

    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }

        let granted = budget.claim(read);
        captured.extend_from_slice(&chunk[..granted]);

        if let Channel::Secondary = channel {
            line_start = log_complete_lines(&captured, line_start);
        }
    }

    if let Channel::Secondary = channel {
        log_line(&captured[line_start..]);
    }

    Ok(captured)
}

/// Log every finished line in `captured[from..]`; returns where the
/// unfinished remainder begins.
fn log_complete_lines(captured: &[u8], from: usize) -> usize {
    let mut start = from;
    while let Some(offset) = captured[start..].iter().position(|&b| b == b'\n') {
        log_line(&captured[start..start + offset]);
        start += offset + 1;
    }
    start
}

fn log_line(line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if !text.is_empty() {
        debug!(target: "analysis_bridge::worker", "{}", text);
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
