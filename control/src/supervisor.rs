/// Lifecycle management for the external rotator daemon.
///
/// A [`Supervisor`] owns at most one [`DaemonHandle`]. Starting the daemon
/// spawns two background tasks bound to the handle:
///   - an output drain that reads stdout and stderr line by line into the
///     handle's history and the log sink
///   - an exit monitor that owns the `Child`, waits for it to exit and tells
///     a requested stop apart from a crash
///
/// After `start` returns, the exit monitor is the only writer of the
/// handle's state, unless it stops answering and `stop` marks the handle
/// `Failed`. The monitor settles the process and publishes the state before
/// it touches the log sink. The sink is a bounded channel whose producers
/// await `send`, so events are never dropped and arrive in the order they
/// happened.
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, Sleep};

use crate::config::ConnectionConfig;
use crate::error::RotorError;
use crate::event::SupervisorEvent;
use crate::output::{OutputHistory, OutputLine, OutputStream, DEFAULT_HISTORY_LINES};
use crate::process_scan;

/// Capacity of the log sink channel created by [`log_sink`].
pub const LOG_SINK_CAPACITY: usize = 256;

/// How long the output drain waits for another line once the process has
/// exited. Bounds the wait when a grandchild still holds the pipes open.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Extra time `stop` allows the monitor to report beyond the configured stop timeout.
const MONITOR_JOIN_SLACK: Duration = Duration::from_secs(2);

/// Lifecycle state of a supervised daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DaemonState {
    /// The process exists (or is being created) and has not been reaped.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DaemonState::Starting | DaemonState::Running | DaemonState::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Stopped | DaemonState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DaemonState::NotStarted => "not_started",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
            DaemonState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates a log sink with the standard capacity.
pub fn log_sink() -> (mpsc::Sender<SupervisorEvent>, mpsc::Receiver<SupervisorEvent>) {
    mpsc::channel(LOG_SINK_CAPACITY)
}

/// Returns the first directory in `search_paths` that contains a regular
/// file named `binary_name`. Directories are tried in the given order.
pub fn resolve_executable(search_paths: &[PathBuf], binary_name: &str) -> Option<PathBuf> {
    search_paths
        .iter()
        .map(|dir| dir.join(binary_name))
        .find(|candidate| candidate.is_file())
}

/// How the exit monitor saw the process end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitOutcome {
    Stopped,
    Killed,
    Unexpected,
}

/// A supervised daemon process.
pub struct DaemonHandle {
    pid: Option<u32>,
    exe: PathBuf,
    state_tx: Arc<watch::Sender<DaemonState>>,
    state_rx: watch::Receiver<DaemonState>,
    outcome_rx: watch::Receiver<Option<ExitOutcome>>,
    history: Arc<Mutex<OutputHistory>>,
    stop_tx: watch::Sender<bool>,
    stop_timeout: Duration,
    monitor: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Handle for a process that could not be created.
    fn failed(exe: PathBuf, stop_timeout: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(DaemonState::Failed);
        let (_, outcome_rx) = watch::channel(None);
        let (stop_tx, _) = watch::channel(false);
        Self {
            pid: None,
            exe,
            state_tx: Arc::new(state_tx),
            state_rx,
            outcome_rx,
            history: Arc::new(Mutex::new(OutputHistory::default())),
            stop_tx,
            stop_timeout,
            monitor: None,
            drain: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.exe
    }

    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition of this handle.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state_rx.clone()
    }

    /// The most recent captured output lines, oldest first.
    pub fn output_snapshot(&self) -> Vec<OutputLine> {
        match self.history.lock() {
            Ok(h) => h.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    /// Lines captured since the process started, including ones no longer
    /// held in the history.
    pub fn output_total(&self) -> u64 {
        match self.history.lock() {
            Ok(h) => h.total(),
            Err(poisoned) => poisoned.into_inner().total(),
        }
    }

    /// Waits until the process has been reaped and returns the final state.
    pub async fn wait_for_exit(&self) -> DaemonState {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        // If the monitor is gone, whatever it last published is final.
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}

/// Owns the daemon process for as long as the operator keeps it started.
pub struct Supervisor {
    sink: mpsc::Sender<SupervisorEvent>,
    handle: Option<DaemonHandle>,
    history_lines: usize,
}

impl Supervisor {
    pub fn new(sink: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            sink,
            handle: None,
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }

    /// Sets how many output lines each new handle retains.
    pub fn with_history_lines(mut self, lines: usize) -> Self {
        self.history_lines = lines;
        self
    }

    pub fn handle(&self) -> Option<&DaemonHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> DaemonState {
        self.handle
            .as_ref()
            .map_or(DaemonState::NotStarted, DaemonHandle::state)
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    async fn emit(&self, event: SupervisorEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.sink.send(event).await;
    }

    /// Spawns the daemon for `config`.
    ///
    /// Fails with `AlreadyRunning` while a previous process is still alive,
    /// leaving it untouched. The output drain and exit monitor run in the
    /// background; this call returns as soon as the process exists.
    pub async fn start(&mut self, config: &ConnectionConfig) -> Result<&DaemonHandle, RotorError> {
        if let Some(h) = &self.handle {
            if h.state().is_active() {
                return Err(RotorError::AlreadyRunning { pid: h.pid() });
            }
        }
        config.validate()?;

        let exe = match &config.executable_path {
            Some(path) => path.clone(),
            None => resolve_executable(&config.effective_search_paths(), &config.daemon_binary)
                .ok_or_else(|| RotorError::ExecutableNotFound {
                    binary: config.daemon_binary.clone(),
                })?,
        };
        let args = config.daemon_args();

        let binary_name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.daemon_binary.clone());
        let scan_name = binary_name.clone();
        let foreign = tokio::task::spawn_blocking(move || process_scan::foreign_instances(&scan_name))
            .await
            .unwrap_or_else(|e| {
                log::warn!(target: "supervisor", "Process scan failed: {e}");
                Vec::new()
            });
        for pid in foreign {
            log::warn!(target: "supervisor", "Another {binary_name} is already running (pid {pid})");
            self.emit(SupervisorEvent::ForeignInstance { pid }).await;
        }

        log::info!(target: "supervisor", "Starting {} {}", exe.display(), args.join(" "));
        self.emit(SupervisorEvent::Starting {
            exe: exe.clone(),
            args: args.clone(),
        })
        .await;

        let (state_tx, state_rx) = watch::channel(DaemonState::Starting);
        let spawned = Command::new(&exe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {e}", exe.display());
                log::error!(target: "supervisor", "Spawn failed: {reason}");
                self.handle = Some(DaemonHandle::failed(exe, config.stop_timeout()));
                self.emit(SupervisorEvent::SpawnFailed {
                    reason: reason.clone(),
                })
                .await;
                return Err(RotorError::SpawnFailed(reason));
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let history = Arc::new(Mutex::new(OutputHistory::new(self.history_lines)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let state_tx = Arc::new(state_tx);

        state_tx.send_replace(DaemonState::Running);
        log::info!(target: "supervisor", "Daemon running (pid {pid:?})");
        self.emit(SupervisorEvent::Started { pid }).await;

        let drain = tokio::spawn(drain_output(
            stdout.map(|s| LineSource::new(BufReader::new(s))),
            stderr.map(|s| LineSource::new(BufReader::new(s))),
            Arc::clone(&history),
            self.sink.clone(),
            exited_rx,
        ));
        let monitor = tokio::spawn(monitor_exit(
            child,
            pid,
            Arc::clone(&state_tx),
            stop_rx,
            exited_tx,
            outcome_tx,
            self.sink.clone(),
            config.stop_timeout(),
        ));

        Ok(&*self.handle.insert(DaemonHandle {
            pid,
            exe,
            state_tx,
            state_rx,
            outcome_rx,
            history,
            stop_tx,
            stop_timeout: config.stop_timeout(),
            monitor: Some(monitor),
            drain: Some(drain),
        }))
    }

    /// Requests a graceful stop and waits, bounded, for the process to exit.
    ///
    /// A no-op when nothing is running. Returns `Timeout` if the process
    /// ignored the request and had to be killed; the handle is then `Failed`.
    pub async fn stop(&mut self) -> Result<(), RotorError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        if !handle.state().is_active() {
            return Ok(());
        }

        log::info!(target: "supervisor", "Stopping daemon (pid {:?})", handle.pid);
        handle.stop_tx.send_replace(true);

        let mut outcome_rx = handle.outcome_rx.clone();
        let reported = timeout(
            handle.stop_timeout + MONITOR_JOIN_SLACK,
            outcome_rx.wait_for(Option::is_some),
        )
        .await
        .ok()
        .and_then(|seen| seen.ok().and_then(|o| *o));

        let outcome = match reported {
            Some(outcome) => outcome,
            None => {
                // Dropping the child inside the aborted monitor kills it.
                log::error!(target: "supervisor", "Exit monitor did not report in time; killing daemon (pid {:?})", handle.pid);
                if let Some(monitor) = &handle.monitor {
                    monitor.abort();
                }
                handle.state_tx.send_replace(DaemonState::Failed);
                ExitOutcome::Killed
            }
        };
        // The monitor may still be delivering its events to a slow sink.
        handle.monitor = None;

        if let Some(drain) = handle.drain.take() {
            if timeout(DRAIN_GRACE, drain).await.is_err() {
                log::debug!(target: "supervisor", "Output drain still delivering after stop");
            }
        }

        match outcome {
            ExitOutcome::Stopped | ExitOutcome::Unexpected => Ok(()),
            ExitOutcome::Killed => Err(RotorError::Timeout(format!(
                "waiting for daemon (pid {:?}) to exit",
                handle.pid
            ))),
        }
    }
}

/// Owns the child process until it has been reaped.
///
/// The exit is settled and published before any event is sent, so a full
/// sink can delay the events but never the signal, the kill or the state.
async fn monitor_exit(
    mut child: Child,
    pid: Option<u32>,
    state_tx: Arc<watch::Sender<DaemonState>>,
    mut stop_rx: watch::Receiver<bool>,
    exited_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<ExitOutcome>>,
    sink: mpsc::Sender<SupervisorEvent>,
    stop_timeout: Duration,
) {
    let (outcome, events) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            state_tx.send_replace(DaemonState::Failed);
            log::error!(target: "supervisor", "Daemon exited unexpectedly (pid {pid:?}, exit code {code:?})");
            (ExitOutcome::Unexpected, vec![SupervisorEvent::UnexpectedExit { code }])
        }
        // Also taken when the supervisor drops the handle.
        _ = stop_rx.changed() => {
            state_tx.send_replace(DaemonState::Stopping);
            request_termination(&mut child, pid);

            match timeout(stop_timeout, child.wait()).await {
                Ok(status) => {
                    let code = status.ok().and_then(|s| s.code());
                    state_tx.send_replace(DaemonState::Stopped);
                    log::info!(target: "supervisor", "Daemon stopped (pid {pid:?}, exit code {code:?})");
                    (
                        ExitOutcome::Stopped,
                        vec![SupervisorEvent::StopRequested { pid }, SupervisorEvent::Stopped { code }],
                    )
                }
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        log::error!(target: "supervisor", "Failed to kill daemon (pid {pid:?}): {e}");
                    }
                    state_tx.send_replace(DaemonState::Failed);
                    log::error!(target: "supervisor", "Daemon ignored stop request and was killed (pid {pid:?})");
                    (
                        ExitOutcome::Killed,
                        vec![SupervisorEvent::StopRequested { pid }, SupervisorEvent::StopTimedOut { pid }],
                    )
                }
            }
        }
    };

    let _ = exited_tx.send(true);
    outcome_tx.send_replace(Some(outcome));
    for event in events {
        if sink.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signals a child we spawned and have not reaped yet, so the
        // pid cannot have been recycled.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Line reader that tolerates non-UTF-8 output and keeps partial lines
/// across cancelled reads.
struct LineSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineSource<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let text = String::from_utf8_lossy(&self.buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                self.buf.clear();
                Some(text)
            }
            Err(e) => {
                log::debug!(target: "supervisor", "Output read failed: {e}");
                None
            }
        }
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(source: &mut Option<LineSource<R>>) -> Option<String> {
    match source {
        Some(s) => s.next_line().await,
        None => std::future::pending().await,
    }
}

/// Drains both pipes until they close, or until no line has arrived for
/// [`DRAIN_GRACE`] after the process exited.
async fn drain_output<O, E>(
    mut stdout: Option<LineSource<O>>,
    mut stderr: Option<LineSource<E>>,
    history: Arc<Mutex<OutputHistory>>,
    sink: mpsc::Sender<SupervisorEvent>,
    mut exited_rx: watch::Receiver<bool>,
) where
    O: AsyncBufRead + Unpin,
    E: AsyncBufRead + Unpin,
{
    let mut grace: Option<Pin<Box<Sleep>>> = None;

    while stdout.is_some() || stderr.is_some() {
        let (stream, text) = tokio::select! {
            // Ready lines always win over the grace timer.
            biased;
            line = next_line(&mut stdout) => match line {
                Some(text) => (OutputStream::Stdout, text),
                None => { stdout = None; continue; }
            },
            line = next_line(&mut stderr) => match line {
                Some(text) => (OutputStream::Stderr, text),
                None => { stderr = None; continue; }
            },
            _ = exited_rx.changed(), if grace.is_none() => {
                grace = Some(Box::pin(sleep(DRAIN_GRACE)));
                continue;
            }
            _ = async { if let Some(g) = grace.as_mut() { g.await } }, if grace.is_some() => {
                log::debug!(target: "supervisor", "Output pipes still open after exit; stopping drain");
                break;
            }
        };

        let line = match history.lock() {
            Ok(mut h) => h.push(stream, text),
            Err(poisoned) => poisoned.into_inner().push(stream, text),
        };
        log::debug!(target: "supervisor", "[{}] {}", line.stream, line.text);
        // Keep draining even without a listener so the child never blocks on a full pipe.
        let _ = sink.send(SupervisorEvent::Output(line)).await;
        // Time spent waiting on the sink does not count against the grace.
        if let Some(g) = grace.as_mut() {
            g.as_mut().reset(Instant::now() + DRAIN_GRACE);
        }
    }
}
