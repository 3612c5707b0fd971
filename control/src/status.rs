use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session snapshot written to status.toml next to the config file.
/// External presentation layers read this file (read-only) to draw the
/// rotator without talking to the daemon themselves.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionStatus {
    /// Control panel version (set from Cargo.toml at compile time).
    pub version: String,
    /// Daemon lifecycle state, e.g. "running" or "failed".
    pub daemon_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// host:port of the daemon's command endpoint.
    pub endpoint: String,
    pub device: String,
    /// Whether the position poller is running.
    pub polling: bool,
    /// Last polled azimuth in degrees, normalized to [0, 360).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azimuth: Option<f64>,
    /// Last polled elevation in degrees, clamped to [0, 180].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    /// Most recent command or poll failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// RFC 3339 time the snapshot was taken.
    pub updated_at: String,
}

impl SessionStatus {
    pub fn new(daemon_state: &str, endpoint: String, device: String) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            daemon_state: daemon_state.to_string(),
            pid: None,
            endpoint,
            device,
            polling: false,
            azimuth: None,
            elevation: None,
            last_error: None,
            updated_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write must never take the session down.
pub fn write_status(path: &Path, status: &SessionStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::warn!(target: "status", "Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                log::warn!(target: "status", "Failed to write status file: {e}");
            }
        }
        Err(e) => log::warn!(target: "status", "Failed to serialize status: {e}"),
    }
}
