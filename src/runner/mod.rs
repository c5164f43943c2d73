//! Resource-limited process runner.
//!
//! Spawns exactly one child process per call, never through a shell, and
//! drives it to one of these outcomes:
//! - clean exit (code 0) → `RunOutput`
//! - non-zero exit → `RunnerError::NonZeroExit` with both captured streams
//! - timeout / buffer / memory / CPU ceiling → the process is terminated
//!   (`SIGTERM`, then `SIGKILL` after a grace period) and the call fails
//!
//! Output is accumulated and also pushed chunk by chunk to an optional
//! callback so the streaming pipeline can observe it live.

pub mod monitor;
pub mod validate;

use crate::errors::RunnerError;
use monitor::ResourceMonitor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Size of a single read from a child's output pipe.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Default interval between resource samples.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A decoded piece of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

/// Callback receiving output chunks as they arrive.
pub type ChunkCallback = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Ceilings applied to one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    /// Per-stream byte ceiling.
    pub max_output_bytes: usize,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_output_bytes: 10 * 1024 * 1024,
            max_memory_mb: Some(2048),
            max_cpu_secs: Some(600),
        }
    }
}

/// Everything needed to start one child process.
#[derive(Clone)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Written to stdin, which is then closed. Stdin is closed even when
    /// this is `None`, for tools that wait on EOF before reading arguments.
    pub stdin: Option<String>,
    pub limits: ResourceLimits,
    pub on_chunk: Option<ChunkCallback>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            stdin: None,
            limits: ResourceLimits::default(),
            on_chunk: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_callback(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }

    /// Human-readable echo of the command line (arguments are not quoted).
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("stdin_bytes", &self.stdin.as_ref().map(|s| s.len()))
            .field("limits", &self.limits)
            .field("on_chunk", &self.on_chunk.is_some())
            .finish()
    }
}

/// Output of a process that exited with code 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub working_dir: PathBuf,
}

/// Spawns and supervises external processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    allowed_root: Option<PathBuf>,
    kill_grace: Duration,
    monitor_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            allowed_root: None,
            kill_grace: DEFAULT_KILL_GRACE,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict working directories to `root` and its descendants.
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.allowed_root = Some(root.into());
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Run one process to completion under the request's limits.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutput, RunnerError> {
        validate::validate_command(&request.command, &request.args)?;
        let working_dir =
            validate::resolve_working_dir(&request.working_dir, self.allowed_root.as_deref())?;

        let start = Instant::now();
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunnerError::SpawnFailed {
            command: request.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(command = %request.command, pid = ?pid, "spawned process");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = request.stdin.clone();
            tokio::spawn(async move {
                if let Some(payload) = payload
                    && let Err(e) = stdin.write_all(payload.as_bytes()).await
                {
                    debug!(error = %e, "stdin write ended early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let outcome = self.drive(&mut child, pid, &request).await;

        let duration = start.elapsed();
        match outcome {
            Ok(Drained {
                status,
                stdout,
                stderr,
            }) => {
                let code = exit_code(&status);
                debug!(pid = ?pid, code, duration_ms = duration.as_millis() as u64, "process exited");
                if status.success() {
                    Ok(RunOutput {
                        stdout,
                        stderr,
                        exit_code: code,
                        duration,
                        working_dir,
                    })
                } else {
                    Err(RunnerError::NonZeroExit {
                        code,
                        stdout,
                        stderr,
                    })
                }
            }
            Err(err) => {
                warn!(pid = ?pid, error = %err, "terminating process");
                terminate(&mut child, self.kill_grace).await;
                Err(err)
            }
        }
    }

    /// Pump both output pipes until EOF and the process exits, or until a
    /// ceiling is hit. The caller terminates the child on `Err`.
    async fn drive(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        request: &RunRequest,
    ) -> Result<Drained, RunnerError> {
        let limits = &request.limits;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

        let mut out = StreamCapture::new(StreamKind::Stdout, limits.max_output_bytes);
        let mut err = StreamCapture::new(StreamKind::Stderr, limits.max_output_bytes);
        let mut out_chunk = [0u8; READ_CHUNK_SIZE];
        let mut err_chunk = [0u8; READ_CHUNK_SIZE];
        let mut out_open = true;
        let mut err_open = true;

        let monitor = ResourceMonitor::new(pid, limits.max_memory_mb, limits.max_cpu_secs);
        let mut ticker = tokio::time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        let deadline = tokio::time::sleep(limits.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if out_open => match read? {
                    0 => out_open = false,
                    n => out.absorb(&out_chunk[..n], request.on_chunk.as_ref())?,
                },
                read = stderr.read(&mut err_chunk), if err_open => match read? {
                    0 => err_open = false,
                    n => err.absorb(&err_chunk[..n], request.on_chunk.as_ref())?,
                },
                status = child.wait(), if !out_open && !err_open => break status?,
                _ = &mut deadline => {
                    return Err(RunnerError::Timeout { after: limits.timeout });
                }
                _ = ticker.tick(), if monitor.is_active() => {
                    if let Some(exceeded) = monitor.check().await {
                        return Err(exceeded);
                    }
                }
            }
        };

        Ok(Drained {
            status,
            stdout: out.finish(request.on_chunk.as_ref()),
            stderr: err.finish(request.on_chunk.as_ref()),
        })
    }
}

struct Drained {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

/// Accumulates one stream, enforces its ceiling and decodes chunks for the
/// callback without splitting multi-byte characters.
struct StreamCapture {
    kind: StreamKind,
    limit: usize,
    bytes: Vec<u8>,
    pending: Vec<u8>,
}

impl StreamCapture {
    fn new(kind: StreamKind, limit: usize) -> Self {
        Self {
            kind,
            limit,
            bytes: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn absorb(&mut self, data: &[u8], callback: Option<&ChunkCallback>) -> Result<(), RunnerError> {
        if self.bytes.len() + data.len() > self.limit {
            return Err(RunnerError::BufferExceeded {
                stream: self.kind,
                limit: self.limit,
            });
        }
        self.bytes.extend_from_slice(data);

        if let Some(callback) = callback {
            self.pending.extend_from_slice(data);
            let text = take_decodable(&mut self.pending);
            if !text.is_empty() {
                callback(&OutputChunk {
                    stream: self.kind,
                    text,
                });
            }
        }
        Ok(())
    }

    fn finish(mut self, callback: Option<&ChunkCallback>) -> String {
        if let Some(callback) = callback
            && !self.pending.is_empty()
        {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            callback(&OutputChunk {
                stream: self.kind,
                text,
            });
        }
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Decode the longest valid UTF-8 prefix of `pending`, leaving an incomplete
/// trailing sequence for the next read. Invalid bytes are replaced.
fn take_decodable(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Graceful-then-forceful termination of a child and its process group.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    signal_group(pid, Signal::Terminate);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid, "process exited after SIGTERM"),
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, killing");
            signal_group(pid, Signal::Kill);
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill process");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions. The child was
    // spawned as leader of its own process group, so -pid addresses it and
    // any descendants; fall back to the single pid if the group is gone.
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}
