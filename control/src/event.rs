use std::path::PathBuf;

use crate::output::OutputLine;

/// Everything the supervisor reports to the log sink, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// About to spawn `exe` with `args`.
    Starting { exe: PathBuf, args: Vec<String> },
    /// Another daemon process with the same binary name is already running.
    ForeignInstance { pid: u32 },
    /// The daemon process was created.
    Started { pid: Option<u32> },
    /// Process creation failed; the handle is now `Failed`.
    SpawnFailed { reason: String },
    /// One line drained from the daemon's stdout or stderr.
    Output(OutputLine),
    /// A graceful stop was requested.
    StopRequested { pid: Option<u32> },
    /// The daemon exited after a stop request.
    Stopped { code: Option<i32> },
    /// The daemon did not exit within the stop timeout and was killed.
    StopTimedOut { pid: Option<u32> },
    /// The daemon exited without being asked to.
    UnexpectedExit { code: Option<i32> },
}

impl std::fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorEvent::Starting { exe, args } => {
                write!(f, "starting {} {}", exe.display(), args.join(" "))
            }
            SupervisorEvent::ForeignInstance { pid } => {
                write!(f, "warning: another daemon instance is already running (pid {pid})")
            }
            SupervisorEvent::Started { pid } => match pid {
                Some(pid) => write!(f, "daemon started (pid {pid})"),
                None => f.write_str("daemon started"),
            },
            SupervisorEvent::SpawnFailed { reason } => write!(f, "daemon failed to start: {reason}"),
            SupervisorEvent::Output(line) => f.write_str(&line.text),
            SupervisorEvent::StopRequested { .. } => f.write_str("stopping daemon"),
            SupervisorEvent::Stopped { code } => match code {
                Some(code) => write!(f, "daemon stopped (exit code {code})"),
                None => f.write_str("daemon stopped"),
            },
            SupervisorEvent::StopTimedOut { pid } => {
                write!(f, "daemon did not exit in time and was killed (pid {pid:?})")
            }
            SupervisorEvent::UnexpectedExit { code } => match code {
                Some(code) => write!(f, "daemon exited unexpectedly (exit code {code})"),
                None => f.write_str("daemon exited unexpectedly (killed by signal)"),
            },
        }
    }
}
