/// Worker lifecycle against the OS process table: start, stop, restart,
/// and the liveness check every other operation relies on.
use crate::config::{Timings, WorkerConfig};
use crate::log_sink::LogSink;
use crate::pidfile::{PidFile, PidFileError};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Which termination step ended the worker during `stop`.
///
/// Escalation is a two-step transition: `Graceful` (SIGTERM, then the
/// grace period) and, if the worker is still present, `Forced` (SIGKILL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

impl Termination {
    pub fn signal(self) -> Signal {
        match self {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        }
    }

    /// The next step, if there is one.
    pub fn escalate(self) -> Option<Termination> {
        match self {
            Termination::Graceful => Some(Termination::Forced),
            Termination::Forced => None,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Graceful => write!(f, "graceful"),
            Termination::Forced => write!(f, "forced"),
        }
    }
}

/// Errors from `start` (and the start half of `restart`).
#[derive(Debug)]
pub enum StartError {
    /// A live worker is already tracked; nothing was spawned.
    AlreadyRunning { pid: u32 },
    /// The worker was spawned but exited before the settle interval elapsed.
    StartFailed { pid: u32 },
    /// The worker executable could not be launched.
    Spawn { source: std::io::Error },
    /// The log file could not be opened for the worker's output.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The marker could not be written; the spawned worker was killed.
    PidFile { source: PidFileError },
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyRunning { pid } => {
                write!(f, "worker is already running (pid {pid})")
            }
            StartError::StartFailed { pid } => {
                write!(f, "worker (pid {pid}) exited immediately after launch")
            }
            StartError::Spawn { source } => write!(f, "failed to launch worker: {source}"),
            StartError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            StartError::PidFile { source } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::AlreadyRunning { .. } | StartError::StartFailed { .. } => None,
            StartError::Spawn { source } => Some(source),
            StartError::LogFile { source, .. } => Some(source),
            StartError::PidFile { source } => Some(source),
        }
    }
}

/// Errors from `stop`. Once a worker is found, stop always succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopError {
    NotRunning,
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopError::NotRunning => write!(f, "worker is not running"),
        }
    }
}

impl std::error::Error for StopError {}

struct TrackedChild {
    pid: u32,
    handle: Child,
}

/// Owns the liveness marker and drives the worker through its lifecycle.
pub struct ProcessController {
    worker: WorkerConfig,
    timings: Timings,
    pid_file: PidFile,
    log: LogSink,
    /// Worker spawned by this supervisor instance, kept so it can be reaped.
    child: Option<TrackedChild>,
}

impl ProcessController {
    pub fn new(worker: WorkerConfig, timings: Timings, pid_file: PidFile, log: LogSink) -> Self {
        Self {
            worker,
            timings,
            pid_file,
            log,
            child: None,
        }
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Whether the tracked worker is alive. Clears a stale marker as a side effect.
    pub fn is_running(&mut self) -> bool {
        self.running_pid().is_some()
    }

    /// The pid of the tracked worker if it is alive.
    ///
    /// This is the only place stale markers are purged: a marker whose
    /// process has exited is removed before returning `None`.
    pub fn running_pid(&mut self) -> Option<u32> {
        let pid = self.pid_file.read()?;
        if self.process_alive(pid) {
            return Some(pid);
        }

        tracing::info!(pid, "worker no longer running, clearing stale pid file");
        self.log
            .record(&format!("Stale pid file removed (pid {pid} is not running)"));
        self.pid_file.clear();
        None
    }

    /// Launch the worker and wait out the settle interval.
    pub async fn start(&mut self) -> Result<u32, StartError> {
        if let Some(pid) = self.running_pid() {
            tracing::info!(pid, "start requested but worker is already running");
            return Err(StartError::AlreadyRunning { pid });
        }

        let command_line = command_line(&self.worker);
        tracing::info!(command = %command_line, "starting worker");
        self.log.record(&format!("Starting worker: {command_line}"));

        let log_err = |e: std::io::Error| StartError::LogFile {
            path: self.log.path().to_path_buf(),
            source: e,
        };
        let stdout = self.log.open_append().map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let mut command = Command::new(&self.worker.command);
        command
            .args(&self.worker.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0); // Own process group so stop can signal the whole tree
        if let Some(dir) = &self.worker.working_dir {
            command.current_dir(dir);
        }

        let handle = match command.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "failed to launch worker");
                self.log
                    .record(&format!("ERROR: failed to launch worker: {e}"));
                return Err(StartError::Spawn { source: e });
            }
        };
        let Some(pid) = handle.id() else {
            return Err(StartError::Spawn {
                source: std::io::Error::other("spawned worker has no pid"),
            });
        };
        self.child = Some(TrackedChild { pid, handle });

        if let Err(e) = self.pid_file.write(pid) {
            tracing::error!(pid, error = %e, "failed to record worker pid, killing worker");
            self.log
                .record(&format!("ERROR: {e}; killing untracked worker (pid {pid})"));
            let _ = send_signal(pid, Signal::SIGKILL);
            self.child = None;
            return Err(StartError::PidFile { source: e });
        }

        tracing::debug!(
            pid,
            settle_ms = self.timings.settle.as_millis() as u64,
            "waiting for worker to settle"
        );
        if self.wait_for_exit(pid, self.timings.settle).await {
            tracing::warn!(pid, "worker exited during settle interval");
            self.log.record(&format!(
                "ERROR: worker (pid {pid}) exited during startup, check the log above for its output"
            ));
            self.pid_file.clear();
            return Err(StartError::StartFailed { pid });
        }

        tracing::info!(pid, "worker started");
        self.log.record(&format!("Worker started (pid {pid})"));
        Ok(pid)
    }

    /// Terminate the worker: SIGTERM, grace period, then SIGKILL if needed.
    pub async fn stop(&mut self) -> Result<Termination, StopError> {
        let Some(pid) = self.running_pid() else {
            tracing::info!("stop requested but worker is not running");
            return Err(StopError::NotRunning);
        };

        tracing::info!(pid, "stopping worker");
        self.log.record(&format!("Stopping worker (pid {pid})"));

        let mut step = Termination::Graceful;
        loop {
            let signal = step.signal();
            if let Err(e) = send_signal(pid, signal) {
                tracing::debug!(pid, %signal, error = %e, "signal delivery failed");
            }

            let window = match step {
                Termination::Graceful => self.timings.grace,
                Termination::Forced => self.timings.kill_wait,
            };
            if self.wait_for_exit(pid, window).await {
                break;
            }

            match step.escalate() {
                Some(next) => {
                    tracing::warn!(
                        pid,
                        grace_secs = self.timings.grace.as_secs_f64(),
                        "worker ignored SIGTERM, sending SIGKILL"
                    );
                    self.log.record(&format!(
                        "WARNING: worker (pid {pid}) did not exit after SIGTERM, sending SIGKILL"
                    ));
                    step = next;
                }
                None => {
                    tracing::warn!(pid, "worker still present after SIGKILL");
                    break;
                }
            }
        }

        self.pid_file.clear();
        self.child = None;
        tracing::info!(pid, termination = %step, "worker stopped");
        self.log
            .record(&format!("Worker stopped (pid {pid}, {step})"));
        Ok(step)
    }

    /// Stop (if running), pause, then start.
    pub async fn restart(&mut self) -> Result<u32, StartError> {
        self.log.record("Restarting worker");
        match self.stop().await {
            Ok(_) => {}
            Err(StopError::NotRunning) => {
                tracing::info!("worker was not running, starting fresh");
                self.log.record("Worker was not running, starting it");
            }
        }
        tokio::time::sleep(self.timings.restart_pause).await;
        self.start().await
    }

    /// Probe `pid`, reaping our own child first so an exited worker is never
    /// reported alive as a zombie.
    fn process_alive(&mut self, pid: u32) -> bool {
        self.reap(pid);
        pid_alive(pid)
    }

    fn reap(&mut self, pid: u32) {
        let status = match self.child.as_mut() {
            Some(tracked) if tracked.pid == pid => tracked.handle.try_wait(),
            _ => return,
        };
        match status {
            Ok(Some(status)) => {
                tracing::info!(pid, %status, "worker exited");
                self.log
                    .record(&format!("Worker (pid {pid}) exited: {status}"));
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to poll worker exit status"),
        }
    }

    /// Poll until `pid` disappears or `window` elapses. Returns true if it exited.
    async fn wait_for_exit(&mut self, pid: u32, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if !self.process_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.timings.probe_interval.min(deadline - now)).await;
        }
    }
}

fn command_line(worker: &WorkerConfig) -> String {
    std::iter::once(worker.command.as_str())
        .chain(worker.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Signal-0 probe. A permission error still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    matches!(kill(target, None), Ok(()) | Err(Errno::EPERM))
}

/// Signal the worker's process group, falling back to the pid alone when it
/// does not lead a group (e.g. a marker written by something else).
fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    let target = to_pid(pid).ok_or(Errno::ESRCH)?;
    match killpg(target, signal) {
        Ok(()) => Ok(()),
        Err(_) => kill(target, signal),
    }
}
