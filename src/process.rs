//! Spawning and signalling OS processes.
//!
//! Three execution styles are supported:
//!
//! - [`run`]: foreground, output captured, bounded by a timeout.
//! - [`spawn_detached`]: background, stdout/stderr appended to a log file,
//!   placed in its own process group. Only a [`ProcessHandle`] is kept.
//! - [`exec_foreground`]: replaces the current process (alternate execution
//!   mode for tunnels flagged `foreground`).
//!
//! Detached children are tracked in a [`ProcessRegistry`] so an interrupt can
//! terminate them best-effort before the invocation exits.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::types::ProcessHandle;

/// Interval between liveness checks while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A program invocation with a fixed argument set.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    /// Indexes into `args` that must never be logged
    secret_args: Vec<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    /// Add an argument that is shown as `***` when the command is logged.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the process on stdin (foreground runs only).
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn spawn_error(&self, e: io::Error) -> RelayError {
        RelayError::Io(io::Error::new(
            e.kind(),
            format!("failed to run {}: {}", self.program, e),
        ))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&i) {
                write!(f, " ***")?;
            } else if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a foreground run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best human-readable explanation of a failed run.
    pub fn failure_message(&self) -> String {
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        match self.code {
            Some(code) => format!("exit code {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// Run a command in the foreground and capture its output.
///
/// The child is killed if it outlives `timeout`.
pub async fn run(spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
    debug!("Running {}", spec);

    let mut cmd = spec.to_command();
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spec.spawn_error(e))?;

    if let Some(input) = &spec.stdin
        && let Some(mut stdin) = child.stdin.take()
    {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| RelayError::Timeout(format!("`{}` did not finish within {:?}", spec, timeout)))??;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and report only whether it exited successfully.
///
/// Spawn failures and timeouts count as failure.
pub async fn succeeds(spec: &CommandSpec, timeout: Duration) -> bool {
    match run(spec, timeout).await {
        Ok(output) => {
            if !output.success() {
                debug!("{} failed: {}", spec, output.failure_message());
            }
            output.success()
        }
        Err(e) => {
            debug!("{} could not run: {}", spec, e);
            false
        }
    }
}

/// Start a command in the background with output appended to `log_path`.
///
/// The child gets its own process group so it can be signalled as a unit.
/// Must be called from within a Tokio runtime; a reaper task waits on the
/// child so a finished backend does not linger as a zombie.
pub fn spawn_detached(spec: &CommandSpec, log_path: &Path) -> Result<ProcessHandle> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = spec.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| spec.spawn_error(e))?;
    let pid = child.id().ok_or_else(|| {
        RelayError::Io(io::Error::other(format!(
            "{} exited before its pid could be read",
            spec.program
        )))
    })?;

    info!("Started {} (pid {}, log {})", spec, pid, log_path.display());

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("Detached process {} exited with {}", pid, status),
            Err(e) => debug!("Failed to wait on detached process {}: {}", pid, e),
        }
    });

    Ok(ProcessHandle {
        pid,
        log_file: Some(log_path.to_path_buf()),
        started_at: Utc::now(),
    })
}

/// Replace the current process with `spec`.
///
/// Only returns if the replacement failed. On platforms without `exec`, the
/// command runs with inherited stdio and the current process exits with its
/// status.
pub fn exec_foreground(spec: &CommandSpec) -> io::Error {
    info!("Handing the process over to {}", spec);

    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.exec()
    }

    #[cfg(not(unix))]
    {
        match cmd.status() {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(e) => e,
        }
    }
}

/// Locate a binary by name on `PATH`, or verify an explicit path.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Check if a process with the given PID is still alive
///
/// On Unix, uses kill(pid, 0) to check if the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Send a termination signal to `pid` and its process group.
///
/// Returns whether a signal was delivered. Never panics.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: plain signal delivery; a negative pid addresses the group
    unsafe {
        if libc::kill(-pid, libc::SIGTERM) == 0 {
            return true;
        }
        libc::kill(pid, libc::SIGTERM) == 0
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether the current process runs with superuser identity.
#[cfg(unix)]
pub fn is_superuser() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_superuser() -> bool {
    false
}

/// Whether `sudo` can elevate without prompting.
pub async fn has_passwordless_sudo() -> bool {
    succeeds(
        &CommandSpec::new("sudo").args(["-n", "true"]),
        Duration::from_secs(10),
    )
    .await
}

/// Pid recorded in a daemon or backend pid file.
///
/// A missing file yields `None`. Anything but a decimal pid (surrounding
/// whitespace aside) is `InvalidData`.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    let contents = match fs::read_to_string(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        read => read?,
    };
    contents.trim().parse().map(Some).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} holds no pid: {}", path.display(), e),
        )
    })
}

/// Record `pid` at `path`, creating parent directories.
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))
}

/// Delete a pid file. Missing files are not an error.
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    fs::remove_file(path).or_else(|e| match e.kind() {
        io::ErrorKind::NotFound => Ok(()),
        _ => Err(e),
    })
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while is_process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}

/// Registry of detached backend processes known to this invocation.
///
/// Cloning is cheap; all clones share the same map. Keyed by pid, which is
/// unique per invocation.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<DashMap<u32, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ProcessHandle) {
        self.processes.insert(handle.pid, handle);
    }

    /// Forget a process without signalling it.
    pub fn release(&self, pid: u32) -> Option<ProcessHandle> {
        self.processes.remove(&pid).map(|(_, handle)| handle)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.processes.iter().map(|e| e.value().clone()).collect()
    }

    /// Signal every registered process and clear the registry.
    ///
    /// Failures are logged, never escalated. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let pids: Vec<u32> = self.processes.iter().map(|e| *e.key()).collect();
        let mut signalled = 0;
        for pid in pids {
            self.processes.remove(&pid);
            if terminate(pid) {
                signalled += 1;
            } else {
                warn!("Failed to signal process {}", pid);
            }
        }
        signalled
    }
}

/// Install SIGINT/SIGTERM handling that tears down every registered backend.
///
/// After cleanup the process exits with status 130. Cancel the returned token
/// to stop listening once the run finishes normally.
pub fn spawn_shutdown_listener(registry: ProcessRegistry) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            signal = wait_for_interrupt() => {
                match signal {
                    Ok(name) => {
                        warn!(
                            "Received {}, terminating {} tunnel process(es)",
                            name,
                            registry.len()
                        );
                        let signalled = registry.terminate_all();
                        info!("Signalled {} process(es), exiting", signalled);
                        std::process::exit(130);
                    }
                    Err(e) => error!("Failed to install signal handlers: {}", e),
                }
            }
        }
    });

    token
}

#[cfg(unix)]
async fn wait_for_interrupt() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
