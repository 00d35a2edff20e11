//! Subprocess supervision.
//!
//! One task owns each child process and reacts to stream data, process exit,
//! the deadline, memory sampling ticks and registry control messages. Every
//! terminal event goes through [`Lifecycle::resolve`]; the first one wins and
//! later ones are no-ops, which is what keeps an output-limit kill from being
//! overwritten by the close that follows it.

use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::metrics::MetricsAggregator;
use crate::registry::{Control, ExecutionHandle, ExecutionRegistry, RegistryEntryGuard};
use crate::request::ExecutionLimits;

const READ_CHUNK: usize = 8 * 1024;
const RESTRICTED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Applies address-space and descriptor ceilings, then runs the target as `__main__`.
///
/// argv: `-c <this> <target> <address-space bytes> <fd ceiling>`
pub const SANDBOX_BOOTSTRAP: &str = "\
import resource, runpy, sys
target, mem, nofile = sys.argv[1], int(sys.argv[2]), int(sys.argv[3])
resource.setrlimit(resource.RLIMIT_AS, (mem, mem))
resource.setrlimit(resource.RLIMIT_NOFILE, (nofile, nofile))
sys.argv = [target]
runpy.run_path(target, run_name='__main__')
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        })
    }
}

/// Per-execution state machine. The last four variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Init,
    Spawned,
    Running,
    Completed,
    TimedOut,
    OutputLimitKilled(OutputStream),
    SpawnError,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::OutputLimitKilled(_)
                | ExecutionState::SpawnError
        )
    }
}

/// Single-resolution guard over [`ExecutionState`].
#[derive(Debug)]
pub struct Lifecycle {
    state: ExecutionState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ExecutionState::Init,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move between non-terminal states. Ignored once resolved.
    pub fn advance(&mut self, next: ExecutionState) {
        debug_assert!(!next.is_terminal(), "use resolve() for terminal states");
        if !self.is_resolved() {
            self.state = next;
        }
    }

    /// Enter a terminal state. Returns `true` only for the first caller.
    pub fn resolve(&mut self, terminal: ExecutionState) -> bool {
        debug_assert!(terminal.is_terminal());
        if self.is_resolved() {
            return false;
        }
        self.state = terminal;
        true
    }
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Interpreter invocation for `target`, wrapped in the sandbox bootstrap when enabled.
    pub fn interpreter(
        config: &ExecutorConfig,
        working_dir: &Path,
        target: &Path,
        limits: &ExecutionLimits,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        if config.sandbox_enabled {
            args.push("-c".into());
            args.push(SANDBOX_BOOTSTRAP.into());
            args.push(target.as_os_str().to_os_string());
            args.push(limits.memory_limit_bytes().to_string().into());
            args.push(config.max_open_files.to_string().into());
        } else {
            args.push(target.as_os_str().to_os_string());
        }

        Self {
            program: config.interpreter_path.clone(),
            args,
            working_dir: working_dir.to_path_buf(),
            env: restricted_env(),
        }
    }
}

/// The only variables a child process sees.
pub fn restricted_env() -> Vec<(String, String)> {
    [
        ("PATH", RESTRICTED_PATH),
        ("LANG", "C.UTF-8"),
        ("PYTHONIOENCODING", "utf-8"),
        ("PYTHONDONTWRITEBYTECODE", "1"),
        ("PYTHONNOUSERSITE", "1"),
        ("PYTHONUNBUFFERED", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Raw result of a supervised run that got past spawning.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub state: ExecutionState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub peak_memory_bytes: u64,
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Exit code zero and no kill.
    pub fn exited_cleanly(&self) -> bool {
        self.state == ExecutionState::Completed && self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: ExecutionRegistry,
    metrics: Arc<MetricsAggregator>,
    max_output_length: usize,
    sample_interval: Duration,
}

impl ProcessRunner {
    pub fn new(
        registry: ExecutionRegistry,
        metrics: Arc<MetricsAggregator>,
        max_output_length: usize,
        sample_interval: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            max_output_length,
            sample_interval,
        }
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Run `spec` to a terminal state.
    ///
    /// Spawn failures are errors; everything after a successful spawn,
    /// including kills, comes back as a [`ProcessOutcome`] for the caller to
    /// classify.
    pub async fn run(
        &self,
        id: &str,
        spec: &ProcessSpec,
        timeout: Duration,
    ) -> Result<ProcessOutcome, ExecutionError> {
        let mut lifecycle = Lifecycle::default();
        let started = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                lifecycle.resolve(ExecutionState::SpawnError);
                error!(execution = %id, program = %spec.program, error = %source, "failed to spawn interpreter");
                return Err(ExecutionError::Process {
                    message: format!("failed to spawn '{}'", spec.program),
                    source,
                });
            }
        };
        lifecycle.advance(ExecutionState::Spawned);

        let pid = child.id();
        let (handle, mut control) = ExecutionHandle::new(pid);
        if let Err(duplicate) = self.registry.insert(id, handle) {
            // kill_on_drop reaps the child we just started
            return Err(ExecutionError::Process {
                message: duplicate.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, duplicate),
            });
        }
        let entry = RegistryEntryGuard::new(self.registry.clone(), id.to_string());
        lifecycle.advance(ExecutionState::Running);
        debug!(execution = %id, ?pid, "process running");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_chunk = vec![0u8; READ_CHUNK];
        let mut stderr_chunk = vec![0u8; READ_CHUNK];

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut sampler = tokio::time::interval(self.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut peak_memory: u64 = 0;
        let mut exited = false;
        let mut exit_status: Option<ExitStatus> = None;
        let mut control_open = true;

        loop {
            if exited && (lifecycle.is_resolved() || (stdout.is_none() && stderr.is_none())) {
                break;
            }

            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_chunk), if stdout.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stdout = None,
                        Ok(n) => {
                            stdout_buf.extend_from_slice(&stdout_chunk[..n]);
                            if stdout_buf.len() > self.max_output_length {
                                self.kill_for_output(id, OutputStream::Stdout, &mut lifecycle, &entry, &mut child);
                                stdout = None;
                                stderr = None;
                            }
                        }
                    }
                }
                read = read_chunk(&mut stderr, &mut stderr_chunk), if stderr.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stderr = None,
                        Ok(n) => {
                            stderr_buf.extend_from_slice(&stderr_chunk[..n]);
                            if stderr_buf.len() > self.max_output_length {
                                self.kill_for_output(id, OutputStream::Stderr, &mut lifecycle, &entry, &mut child);
                                stdout = None;
                                stderr = None;
                            }
                        }
                    }
                }
                status = child.wait(), if !exited => {
                    exited = true;
                    // reaped: the pid may be reused, so nothing may signal it from here on
                    control_open = false;
                    entry.release();
                    match status {
                        Ok(status) => exit_status = Some(status),
                        Err(err) => warn!(execution = %id, error = %err, "failed to wait on process"),
                    }
                }
                _ = &mut deadline, if !lifecycle.is_resolved() => {
                    if exited {
                        // exited already; a descendant is holding the pipes open
                        stdout = None;
                        stderr = None;
                    } else if lifecycle.resolve(ExecutionState::TimedOut) {
                        entry.release();
                        self.metrics.record_timeout();
                        warn!(execution = %id, timeout_ms = timeout.as_millis() as u64, "execution timed out, killing process");
                        let _ = child.start_kill();
                        stdout = None;
                        stderr = None;
                    }
                }
                _ = sampler.tick(), if !exited => {
                    if let Some(pid) = pid {
                        let rss = sample_memory(pid).await;
                        peak_memory = peak_memory.max(rss);
                    }
                }
                message = control.recv(), if control_open => {
                    match message {
                        Some(Control::Terminate) => {
                            debug!(execution = %id, "terminate requested");
                            terminate(&mut child, pid);
                        }
                        Some(Control::Kill) => {
                            debug!(execution = %id, "kill requested");
                            let _ = child.start_kill();
                        }
                        None => control_open = false,
                    }
                }
                else => break,
            }
        }

        if lifecycle.resolve(ExecutionState::Completed) {
            entry.release();
        }

        let (exit_code, signal) = exit_status.map(split_status).unwrap_or((None, None));
        let outcome = ProcessOutcome {
            state: lifecycle.state(),
            exit_code,
            signal,
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            peak_memory_bytes: peak_memory,
            duration: started.elapsed(),
        };
        debug!(
            execution = %id,
            state = ?outcome.state,
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            peak_memory = outcome.peak_memory_bytes,
            "process closed"
        );
        Ok(outcome)
    }

    fn kill_for_output(
        &self,
        id: &str,
        stream: OutputStream,
        lifecycle: &mut Lifecycle,
        entry: &RegistryEntryGuard,
        child: &mut Child,
    ) {
        if lifecycle.resolve(ExecutionState::OutputLimitKilled(stream)) {
            entry.release();
            warn!(execution = %id, %stream, limit = self.max_output_length, "output limit exceeded, killing process");
            let _ = child.start_kill();
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    match pid {
        Some(pid) => {
            // SAFETY: plain kill(2) on a pid we spawned. Control messages stop
            // being read once the child is reaped, so the pid is still ours.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

/// Resident set size in bytes. Approximate by nature; zero where unsupported.
#[cfg(target_os = "linux")]
async fn sample_memory(pid: u32) -> u64 {
    match tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await {
        Ok(status) => parse_vm_rss(&status).unwrap_or(0),
        Err(_) => 0,
    }
}

#[cfg(not(target_os = "linux"))]
async fn sample_memory(_pid: u32) -> u64 {
    0
}

/// `VmRSS:     1234 kB` → bytes.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next() {
        Some("kB") | Some("KB") | None => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        Some(_) => 1,
    };
    Some(value.saturating_mul(multiplier))
}
