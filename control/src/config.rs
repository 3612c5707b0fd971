use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::Endpoint;
use crate::error::RotorError;

pub const DEFAULT_MODEL: &str = "601";
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD: u32 = 1200;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4533;
pub const DEFAULT_DAEMON_BINARY: &str = "rotctld";
pub const DEFAULT_VERBOSITY: u8 = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;

/// Everything needed to launch the rotator daemon and talk to it.
/// Deserialized from the settings file; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Rotator model identifier passed to the daemon with `-m`.
    pub model: String,
    /// Serial device the rotator is attached to.
    pub device: String,
    pub baud: u32,
    /// Address the daemon listens on for command connections.
    pub host: String,
    pub port: u16,
    /// File name of the daemon executable looked up in the search paths.
    pub daemon_binary: String,
    /// Directories searched in order for `daemon_binary`.
    /// Empty means "use the entries of `PATH`".
    pub executable_search_paths: Vec<PathBuf>,
    /// Explicit executable; bypasses the search when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
    /// Number of `v`s in the daemon's verbosity flag.
    pub verbosity: u8,
    pub poll_interval_ms: u64,
    /// Start polling as soon as a freshly started daemon accepts connections.
    pub poll_on_start: bool,
    pub command_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            device: DEFAULT_DEVICE.to_string(),
            baud: DEFAULT_BAUD,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            daemon_binary: DEFAULT_DAEMON_BINARY.to_string(),
            executable_search_paths: Vec::new(),
            executable_path: None,
            verbosity: DEFAULT_VERBOSITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_on_start: true,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    /// Command endpoint the daemon will be told to listen on.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Search list with the `PATH` fallback applied.
    pub fn effective_search_paths(&self) -> Vec<PathBuf> {
        if !self.executable_search_paths.is_empty() {
            return self.executable_search_paths.clone();
        }
        std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default()
    }

    /// Arguments for the daemon command line, in the order the daemon expects.
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model.clone(),
            "-r".to_string(),
            self.device.clone(),
            "-s".to_string(),
            self.baud.to_string(),
            "-T".to_string(),
            self.host.clone(),
            "-t".to_string(),
            self.port.to_string(),
        ];
        if self.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(self.verbosity as usize)));
        }
        args
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Checks the fields the daemon cannot start without.
    pub fn validate(&self) -> Result<(), RotorError> {
        if self.device.trim().is_empty() {
            return Err(RotorError::InvalidConfig("device path is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(RotorError::InvalidConfig("model identifier is empty".into()));
        }
        if self.baud == 0 {
            return Err(RotorError::InvalidConfig("baud rate must be non-zero".into()));
        }
        if self.host.is_empty() || self.host.chars().any(char::is_whitespace) {
            return Err(RotorError::InvalidConfig(format!(
                "'{}' is not a valid listen host",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(RotorError::InvalidConfig("listen port must be non-zero".into()));
        }
        if self.executable_path.is_none() && self.daemon_binary.trim().is_empty() {
            return Err(RotorError::InvalidConfig("daemon binary name is empty".into()));
        }
        Ok(())
    }
}

/// Loads the settings file at `path`, returning defaults if it does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<ConnectionConfig> {
    if !path.exists() {
        return Ok(ConnectionConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Writes `config` to `path` as TOML, creating parent directories as needed.
pub fn save(path: &Path, config: &ConnectionConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Watches the parent directory of `path` and sends the re-parsed config
/// whenever the file is created or modified.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<ConnectionConfig>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            log::warn!(target: "config", "Failed to create file watcher: {e}");
            return;
        }
    };

    // Editors often save by writing a new file and renaming it over the old one.
    let watch_dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        log::warn!(target: "config", "Failed to watch {}: {e}", watch_dir.display());
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p.ends_with(&path) || p == &path);
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(config).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!(target: "config", "Failed to reload config: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn defaults_match_factory_settings() {
        let c = ConnectionConfig::default();
        assert_eq!(c.model, "601");
        assert_eq!(c.device, "/dev/ttyUSB0");
        assert_eq!(c.baud, 1200);
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 4533);
        assert!(c.executable_search_paths.is_empty());
        assert!(c.executable_path.is_none());
        assert!(c.poll_on_start);
    }

    #[test]
    fn daemon_args_follow_flag_order() {
        let c = ConnectionConfig::default();
        assert_eq!(
            c.daemon_args(),
            vec![
                "-m", "601", "-r", "/dev/ttyUSB0", "-s", "1200", "-T", "127.0.0.1", "-t",
                "4533", "-vvvv"
            ]
        );
    }

    #[test]
    fn daemon_args_omit_verbosity_when_zero() {
        let c = ConnectionConfig {
            verbosity: 0,
            ..ConnectionConfig::default()
        };
        assert!(!c.daemon_args().iter().any(|a| a.starts_with("-v")));
    }

    #[test]
    fn explicit_search_paths_are_kept_in_order() {
        let c = ConnectionConfig {
            executable_search_paths: vec![PathBuf::from("/opt/b"), PathBuf::from("/opt/a")],
            ..ConnectionConfig::default()
        };
        assert_eq!(
            c.effective_search_paths(),
            vec![PathBuf::from("/opt/b"), PathBuf::from("/opt/a")]
        );
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn validate_accepts_defaults() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let bad_host = ConnectionConfig {
            host: "local host".into(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(bad_host.validate(), Err(RotorError::InvalidConfig(_))));

        let bad_port = ConnectionConfig {
            port: 0,
            ..ConnectionConfig::default()
        };
        assert!(matches!(bad_port.validate(), Err(RotorError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_empty_device() {
        let c = ConnectionConfig {
            device: "  ".into(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(c.validate(), Err(RotorError::InvalidConfig(_))));
    }

    // ── load_or_default / save ────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device = \"/dev/ttyACM0\"\nport = 4600\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.device, "/dev/ttyACM0");
        assert_eq!(config.port, 4600);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.baud, DEFAULT_BAUD);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn save_then_load_preserves_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let edited = ConnectionConfig {
            model: "202".into(),
            device: "/dev/ttyS1".into(),
            executable_path: Some(PathBuf::from("/usr/local/bin/rotctld")),
            ..ConnectionConfig::default()
        };

        save(&path, &edited).unwrap();
        assert_eq!(load_or_default(&path).unwrap(), edited);
    }

    #[test]
    fn save_omits_unset_executable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save(&path, &ConnectionConfig::default()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("executable_path"));
        assert!(content.contains("device = \"/dev/ttyUSB0\""));
    }
}
