use thiserror::Error;

/// Failures surfaced by the supervisor, the command client and the poller.
///
/// Every variant is recoverable: the next user action or poll tick may
/// succeed. Messages are stored as strings so the error can be cloned into
/// [`crate::poller::PollState`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RotorError {
    #[error("daemon executable '{binary}' not found in any search path")]
    ExecutableNotFound { binary: String },

    #[error("daemon is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },

    #[error("failed to spawn daemon: {0}")]
    SpawnFailed(String),

    #[error("connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("daemon exited unexpectedly (exit code {code:?})")]
    UnexpectedExit { code: Option<i32> },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RotorError {
    /// Short stable name of the variant, used in status snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            RotorError::ExecutableNotFound { .. } => "executable_not_found",
            RotorError::AlreadyRunning { .. } => "already_running",
            RotorError::SpawnFailed(_) => "spawn_failed",
            RotorError::ConnectionRefused { .. } => "connection_refused",
            RotorError::ProtocolError(_) => "protocol_error",
            RotorError::UnexpectedExit { .. } => "unexpected_exit",
            RotorError::Timeout(_) => "timeout",
            RotorError::InvalidConfig(_) => "invalid_config",
        }
    }
}
