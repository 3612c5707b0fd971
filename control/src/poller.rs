/// Periodic position polling.
///
/// The loop awaits each poll before waiting for the next tick, so polls never
/// overlap. The interval skips ticks that were missed while a poll was in
/// flight instead of queueing them. A failed poll is recorded and the loop
/// carries on with the next tick.
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::client::CommandClient;
use crate::error::RotorError;
use crate::position::Position;

/// Anything that can report the rotator's current position.
pub trait PositionSource: Send + Sync + 'static {
    fn fetch_position(&self) -> impl Future<Output = Result<Position, RotorError>> + Send;
}

impl PositionSource for CommandClient {
    fn fetch_position(&self) -> impl Future<Output = Result<Position, RotorError>> + Send {
        self.get_position()
    }
}

/// What the poller has observed so far. Written only by the polling task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollState {
    /// Position from the most recent successful poll.
    pub last_position: Option<Position>,
    /// When the most recent poll finished. Never decreases.
    pub last_poll_at: Option<Instant>,
    /// Most recent failure; kept after later successes.
    pub last_error: Option<RotorError>,
    pub poll_count: u64,
    pub failure_count: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl PollState {
    /// True when the latest poll succeeded.
    pub fn is_healthy(&self) -> bool {
        self.poll_count > 0 && self.consecutive_failures == 0
    }

    fn record(&mut self, result: Result<Position, RotorError>, at: Instant) {
        self.poll_count += 1;
        self.last_poll_at = Some(match self.last_poll_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
        match result {
            Ok(position) => {
                self.last_position = Some(position);
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.failure_count += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(e);
            }
        }
    }
}

/// A running polling loop.
pub struct PollerHandle {
    /// Setting this to `true` stops the loop, abandoning any poll in flight.
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<PollState>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Latest snapshot of the poll state.
    pub fn state(&self) -> PollState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_rx.clone()
    }

    /// True once the loop has ended, e.g. because the sink was closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!(target: "poller", "Polling task failed: {e}");
        }
    }
}

/// Starts polling `source` every `period`. After each poll the full state
/// snapshot is sent to `sink`; the loop ends when `sink` is closed.
pub fn spawn<S: PositionSource>(
    source: S,
    period: Duration,
    sink: mpsc::Sender<PollState>,
) -> PollerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(PollState::default());
    let task = tokio::spawn(run(source, period, sink, state_tx, stop_rx));
    PollerHandle {
        stop_tx,
        state_rx,
        task,
    }
}

async fn run<S: PositionSource>(
    source: S,
    period: Duration,
    sink: mpsc::Sender<PollState>,
    state_tx: watch::Sender<PollState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut state = PollState::default();
    log::info!(target: "poller", "Polling every {period:?}");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let result = tokio::select! {
            result = source.fetch_position() => result,
            _ = stop_rx.changed() => break,
        };

        match &result {
            Ok(position) => log::trace!(target: "poller", "Poll: {position}"),
            // Only the first failure of a streak is worth a warning.
            Err(e) if state.consecutive_failures == 0 => {
                log::warn!(target: "poller", "Poll failed: {e}")
            }
            Err(e) => log::debug!(target: "poller", "Poll failed again: {e}"),
        }
        state.record(result, Instant::now());
        state_tx.send_replace(state.clone());

        tokio::select! {
            sent = sink.send(state.clone()) => {
                if sent.is_err() {
                    log::debug!(target: "poller", "Presentation sink closed");
                    break;
                }
            }
            _ = stop_rx.changed() => break,
        }
    }

    log::info!(target: "poller", "Polling stopped after {} poll(s)", state.poll_count);
}
