/// One operator session: the connection settings, the supervised daemon and
/// the position poller, owned together instead of living in globals.
///
/// Commands target the endpoint the daemon was started with, so editing the
/// settings while it runs only affects the next start.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::client::{self, CommandClient, Endpoint};
use crate::config::{self, ConnectionConfig};
use crate::error::RotorError;
use crate::event::SupervisorEvent;
use crate::poller::{self, PollState, PollerHandle};
use crate::ports;
use crate::position::Position;
use crate::status::SessionStatus;
use crate::supervisor::{DaemonState, Supervisor};

/// How long `start_daemon` waits for the endpoint before polling.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    config: ConnectionConfig,
    /// Where `save_config` writes; `None` keeps the settings in memory only.
    config_path: Option<PathBuf>,
    supervisor: Supervisor,
    /// Client bound to the endpoint of the running daemon.
    active_client: Option<CommandClient>,
    poller: Option<PollerHandle>,
    poll_sink: mpsc::Sender<PollState>,
    ports: Vec<String>,
}

impl Session {
    pub fn new(
        config: ConnectionConfig,
        config_path: Option<PathBuf>,
        log_sink: mpsc::Sender<SupervisorEvent>,
        poll_sink: mpsc::Sender<PollState>,
    ) -> Self {
        Self {
            config,
            config_path,
            supervisor: Supervisor::new(log_sink),
            active_client: None,
            poller: None,
            poll_sink,
            ports: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn daemon_state(&self) -> DaemonState {
        self.supervisor.state()
    }

    /// Replaces the settings; a running daemon keeps its old ones until restarted.
    pub fn update_config(&mut self, config: ConnectionConfig) {
        if self.supervisor.is_active() && config != self.config {
            log::info!(target: "session", "Settings changed; they apply on the next start");
        }
        self.config = config;
    }

    pub fn set_device(&mut self, device: impl Into<String>) {
        self.config.device = device.into();
    }

    pub fn save_config(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => {
                config::save(path, &self.config)?;
                log::info!(target: "session", "Settings saved to {}", path.display());
            }
            None => log::debug!(target: "session", "No settings file; save skipped"),
        }
        Ok(())
    }

    /// Re-enumerates serial ports and re-selects the device if the current
    /// one disappeared.
    pub fn refresh_ports(&mut self) -> &[String] {
        self.ports = ports::list_available_ports();
        let chosen = ports::choose_device(&self.config.device, &self.ports);
        if chosen != self.config.device {
            log::info!(target: "session", "Device {} not present; using {chosen}", self.config.device);
            self.config.device = chosen;
        }
        &self.ports
    }

    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Saves the settings and spawns the daemon with them, without waiting
    /// for it to listen. Returns the endpoint commands will go to.
    pub async fn launch_daemon(&mut self) -> Result<Endpoint, RotorError> {
        self.config.validate()?;
        if let Err(e) = self.save_config() {
            log::warn!(target: "session", "Could not save settings before start: {e:#}");
        }
        self.supervisor.start(&self.config).await?;
        let client = CommandClient::from_config(&self.config);
        let endpoint = client.endpoint().clone();
        self.active_client = Some(client);
        Ok(endpoint)
    }

    /// Launches the daemon. With `poll_on_start` set, polling begins once
    /// the endpoint accepts connections; if it never does the daemon keeps
    /// running and the readiness error is returned.
    pub async fn start_daemon(&mut self) -> Result<(), RotorError> {
        self.launch_daemon().await?;
        if self.config.poll_on_start {
            self.wait_ready(DEFAULT_READY_TIMEOUT).await?;
            self.start_polling();
        }
        Ok(())
    }

    /// Waits until the daemon accepts command connections.
    pub async fn wait_ready(&self, within: Duration) -> Result<(), RotorError> {
        client::wait_until_accepting(self.client().endpoint(), within).await
    }

    /// Stops polling first so nothing talks to a daemon that is going away.
    pub async fn stop_daemon(&mut self) -> Result<(), RotorError> {
        self.stop_polling().await;
        let result = self.supervisor.stop().await;
        self.active_client = None;
        result
    }

    /// Where commands currently go.
    pub fn endpoint(&self) -> Endpoint {
        self.client().endpoint().clone()
    }

    fn client(&self) -> CommandClient {
        self.active_client
            .clone()
            .unwrap_or_else(|| CommandClient::from_config(&self.config))
    }

    pub async fn set_position(&self, azimuth: f64, elevation: f64) -> Result<(), RotorError> {
        self.client().set_position(azimuth, elevation).await
    }

    pub async fn get_position(&self) -> Result<Position, RotorError> {
        self.client().get_position().await
    }

    /// Starts the poller unless it is already running.
    pub fn start_polling(&mut self) {
        if self.poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        self.poller = Some(poller::spawn(
            self.client(),
            self.config.poll_interval(),
            self.poll_sink.clone(),
        ));
    }

    pub async fn stop_polling(&mut self) {
        if let Some(p) = self.poller.take() {
            p.stop().await;
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    pub fn poll_state(&self) -> Option<PollState> {
        self.poller.as_ref().map(PollerHandle::state)
    }

    /// Snapshot for the status file.
    pub fn status(&self) -> SessionStatus {
        let mut status = SessionStatus::new(
            self.daemon_state().as_str(),
            self.endpoint().to_string(),
            self.config.device.clone(),
        );
        status.pid = self.supervisor.handle().and_then(|h| h.pid());
        status.polling = self.is_polling();
        if let Some(state) = self.poll_state() {
            if let Some(p) = state.last_position.map(|p| p.normalized()) {
                status.azimuth = Some(p.azimuth);
                status.elevation = Some(p.elevation);
            }
            status.last_error = state.last_error.map(|e| e.to_string());
        }
        status
    }

    /// Stops polling and the daemon; errors are logged since nothing is left to retry.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_daemon().await {
            log::error!(target: "session", "Daemon did not stop cleanly: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_echo_rotator;

    fn session(config: ConnectionConfig) -> (Session, mpsc::Receiver<SupervisorEvent>, mpsc::Receiver<PollState>) {
        let (log_tx, log_rx) = mpsc::channel(256);
        let (poll_tx, poll_rx) = mpsc::channel(16);
        (Session::new(config, None, log_tx, poll_tx), log_rx, poll_rx)
    }

    #[tokio::test]
    async fn commands_without_daemon_are_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (s, _log, _poll) = session(ConnectionConfig {
            port,
            ..ConnectionConfig::default()
        });
        assert!(matches!(
            s.get_position().await,
            Err(RotorError::ConnectionRefused { .. })
        ));
    }

    #[tokio::test]
    async fn polling_feeds_presentation_sink() {
        let (ep, _) = spawn_echo_rotator().await;
        let (mut s, _log, mut poll_rx) = session(ConnectionConfig {
            host: ep.host.clone(),
            port: ep.port,
            poll_interval_ms: 50,
            ..ConnectionConfig::default()
        });

        s.set_position(90.0, 30.0).await.unwrap();
        s.start_polling();
        s.start_polling();
        assert!(s.is_polling());

        let snap = poll_rx.recv().await.unwrap();
        assert_eq!(snap.last_position, Some(Position::new(90.0, 30.0)));

        s.stop_polling().await;
        assert!(!s.is_polling());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_returns_before_daemon_listens() {
        use crate::testing::fake_daemon;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut config = fake_daemon(dir.path(), "exec sleep 30");
        config.port = port;
        let (mut s, _log, _poll) = session(config);

        let launched = tokio::time::timeout(Duration::from_secs(2), s.launch_daemon())
            .await
            .expect("launch waited for the endpoint");
        assert_eq!(launched.unwrap().port, port);
        assert_eq!(s.daemon_state(), DaemonState::Running);
        assert!(!s.is_polling());

        s.stop_daemon().await.unwrap();
    }

    #[test]
    fn update_config_replaces_settings() {
        let (mut s, _log, _poll) = session(ConnectionConfig::default());
        s.update_config(ConnectionConfig {
            model: "202".into(),
            ..ConnectionConfig::default()
        });
        assert_eq!(s.config().model, "202");
        s.set_device("/dev/ttyACM3");
        assert_eq!(s.config().device, "/dev/ttyACM3");
    }

    #[test]
    fn save_config_writes_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let (log_tx, _log_rx) = mpsc::channel(4);
        let (poll_tx, _poll_rx) = mpsc::channel(4);
        let config = ConnectionConfig {
            device: "/dev/ttyS7".into(),
            ..ConnectionConfig::default()
        };
        let s = Session::new(config.clone(), Some(path.clone()), log_tx, poll_tx);
        s.save_config().unwrap();
        assert_eq!(config::load_or_default(&path).unwrap(), config);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_poll_stop_cycle() {
        use crate::testing::fake_daemon;

        let dir = tempfile::tempdir().unwrap();
        let (ep, _) = spawn_echo_rotator().await;
        let mut config = fake_daemon(dir.path(), "echo listening\nexec sleep 30");
        config.host = ep.host.clone();
        config.port = ep.port;
        config.poll_interval_ms = 50;
        let config_path = dir.path().join("config.toml");

        let (log_tx, _log_rx) = mpsc::channel(256);
        let (poll_tx, mut poll_rx) = mpsc::channel(16);
        let mut s = Session::new(config.clone(), Some(config_path.clone()), log_tx, poll_tx);

        s.start_daemon().await.unwrap();
        assert_eq!(s.daemon_state(), DaemonState::Running);
        assert!(s.is_polling());
        // Settings are persisted on start.
        assert_eq!(config::load_or_default(&config_path).unwrap(), config);
        assert!(matches!(
            s.start_daemon().await,
            Err(RotorError::AlreadyRunning { .. })
        ));

        s.set_position(180.0, 45.0).await.unwrap();
        let target = Some(Position::new(180.0, 45.0));
        let mut seen = None;
        for _ in 0..20 {
            seen = poll_rx.recv().await.unwrap().last_position;
            if seen == target {
                break;
            }
        }
        assert_eq!(seen, target);

        let status = s.status();
        assert_eq!(status.daemon_state, "running");
        assert!(status.polling);

        s.stop_daemon().await.unwrap();
        assert!(!s.is_polling());
        assert_eq!(s.daemon_state(), DaemonState::Stopped);
        assert_eq!(s.status().daemon_state, "stopped");
    }
}
