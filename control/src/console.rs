//! Line-oriented operator console: parses typed commands and formats what
//! the session reports back.

use thiserror::Error;

use crate::poller::PollState;
use crate::ports::PortEntry;

pub const HELP: &str = "\
commands:
  ports              list serial ports and re-select the device
  device <path>      use <path> as the rotator device
  start              save settings and start the daemon
  stop               stop polling and the daemon
  set <az> <el>      point the rotator (degrees)
  get                read the current position once
  poll on|off        start or stop position polling
  status             show daemon and poll state
  save               write settings to the config file
  help               show this text
  quit               stop everything and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Ports,
    Device(String),
    Start,
    Stop,
    Set { azimuth: f64, elevation: f64 },
    Get,
    Poll(bool),
    Status,
    Save,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a number of degrees")]
    BadNumber(String),
}

/// Parses one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let cmd = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("ports", []) => ConsoleCommand::Ports,
        ("device", [path]) => ConsoleCommand::Device(path.to_string()),
        ("device", _) => return Err(ParseError::Usage("device <path>")),
        ("start", []) => ConsoleCommand::Start,
        ("stop", []) => ConsoleCommand::Stop,
        ("set", [az, el]) => ConsoleCommand::Set {
            azimuth: degrees(az)?,
            elevation: degrees(el)?,
        },
        ("set", _) => return Err(ParseError::Usage("set <az> <el>")),
        ("get", []) => ConsoleCommand::Get,
        ("poll", ["on"]) => ConsoleCommand::Poll(true),
        ("poll", ["off"]) => ConsoleCommand::Poll(false),
        ("poll", _) => return Err(ParseError::Usage("poll on|off")),
        ("status", []) => ConsoleCommand::Status,
        ("save", []) => ConsoleCommand::Save,
        ("help" | "?", []) => ConsoleCommand::Help,
        ("quit" | "exit", []) => ConsoleCommand::Quit,
        _ => return Err(ParseError::Unknown(line.trim().to_string())),
    };
    Ok(Some(cmd))
}

fn degrees(s: &str) -> Result<f64, ParseError> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::BadNumber(s.to_string()))
}

/// One line per port, marking the selected device.
pub fn render_ports(ports: &[PortEntry], selected: &str) -> String {
    if ports.is_empty() {
        return "no serial ports found".to_string();
    }
    ports
        .iter()
        .map(|p| {
            let mark = if p.port_name == selected { '*' } else { ' ' };
            format!("{mark} {:<20} {}", p.port_name, p.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Needle readout for the latest poll.
pub fn render_poll_state(state: &PollState) -> String {
    match (&state.last_position, &state.last_error) {
        (Some(p), _) if state.consecutive_failures == 0 => {
            let n = p.normalized();
            format!("{n} ({})", n.compass_point())
        }
        (Some(p), Some(e)) => format!("{} (stale: {e})", p.normalized()),
        (None, Some(e)) => format!("position unavailable: {e}"),
        _ => "position unknown".to_string(),
    }
}
