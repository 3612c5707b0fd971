//! Command client for the daemon's TCP endpoint.
//!
//! Every request uses its own connection: connect, send one command line,
//! read only the reply lines that command produces, close. The whole
//! exchange runs under a single timeout so a hung daemon cannot stall the
//! caller. Nothing here retries; callers decide whether to try again.
//!
//! Wire format (rotctld network protocol):
//!   set position  `P <az> <el>\n`  →  one acknowledgement line
//!   get position  `p\n`            →  `<az>\n<el>\n`
//! Errors come back as `RPRT <n>` with a negative `n`.

use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use crate::config::ConnectionConfig;
use crate::error::RotorError;
use crate::position::Position;

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Host and port the daemon accepts command connections on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = RotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RotorError::InvalidConfig(format!("'{s}' is not a host:port endpoint"));
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(Endpoint::new(host, port))
    }
}

/// Issues position commands to one daemon endpoint.
#[derive(Debug, Clone)]
pub struct CommandClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.endpoint(), config.command_timeout())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Commands the rotator to `azimuth`/`elevation`.
    ///
    /// The values go out unvalidated; a daemon-side rejection comes back as
    /// `ProtocolError`.
    pub async fn set_position(&self, azimuth: f64, elevation: f64) -> Result<(), RotorError> {
        let request = format!("P {azimuth} {elevation}\n");
        let reply = self.exchange(&request, 1, "set position").await?;
        parse_ack(&reply)?;
        log::debug!(target: "client", "Set position {azimuth} {elevation} on {}", self.endpoint);
        Ok(())
    }

    /// Reads the rotator's current position.
    pub async fn get_position(&self) -> Result<Position, RotorError> {
        let reply = self.exchange("p\n", 2, "get position").await?;
        parse_position(&reply)
    }

    /// Sends `request` and collects up to `reply_lines` lines. A leading
    /// `RPRT` line ends the reply early.
    async fn exchange(
        &self,
        request: &str,
        reply_lines: usize,
        what: &str,
    ) -> Result<Vec<String>, RotorError> {
        let endpoint = &self.endpoint;
        let io_error = |e: std::io::Error| {
            RotorError::ProtocolError(format!("{what} on {endpoint}: {e}"))
        };

        let round_trip = async {
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|e| RotorError::ConnectionRefused {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
            let mut reader = BufReader::new(stream);
            reader.get_mut().write_all(request.as_bytes()).await.map_err(io_error)?;

            let mut lines = Vec::with_capacity(reply_lines);
            while lines.len() < reply_lines {
                let mut line = String::new();
                if reader.read_line(&mut line).await.map_err(io_error)? == 0 {
                    break;
                }
                let line = line.trim().to_string();
                let is_report = lines.is_empty() && report_code(&line).is_some();
                lines.push(line);
                if is_report {
                    break;
                }
            }
            Ok::<_, RotorError>(lines)
        };

        match timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(target: "client", "{what} on {endpoint} timed out after {:?}", self.timeout);
                Err(RotorError::Timeout(format!("{what} on {endpoint}")))
            }
        }
    }
}

/// Numeric code of an `RPRT <n>` line.
fn report_code(line: &str) -> Option<i32> {
    line.strip_prefix("RPRT")?.trim().parse().ok()
}

/// Accepts any non-empty first line except a failing `RPRT`.
fn parse_ack(lines: &[String]) -> Result<(), RotorError> {
    let first = lines
        .first()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RotorError::ProtocolError("no acknowledgement for set position".into()))?;
    match report_code(first) {
        Some(0) | None => Ok(()),
        Some(code) => Err(RotorError::ProtocolError(format!(
            "daemon rejected set position (RPRT {code})"
        ))),
    }
}

/// Expects exactly an azimuth line followed by an elevation line.
fn parse_position(lines: &[String]) -> Result<Position, RotorError> {
    if let Some(code) = lines.first().and_then(|l| report_code(l)) {
        return Err(RotorError::ProtocolError(format!(
            "daemon rejected get position (RPRT {code})"
        )));
    }
    if lines.len() < 2 {
        return Err(RotorError::ProtocolError(format!(
            "expected azimuth and elevation lines, got {}",
            lines.len()
        )));
    }
    Ok(Position::new(
        parse_degrees(&lines[0], "azimuth")?,
        parse_degrees(&lines[1], "elevation")?,
    ))
}

fn parse_degrees(text: &str, what: &str) -> Result<f64, RotorError> {
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RotorError::ProtocolError(format!("{what} '{text}' is not a number"))),
    }
}

/// Retries plain TCP connects until `endpoint` accepts one or `within` elapses.
///
/// Used after starting the daemon, which needs a moment before it listens.
pub async fn wait_until_accepting(endpoint: &Endpoint, within: Duration) -> Result<(), RotorError> {
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RotorError::Timeout(format!("waiting for {endpoint} to accept connections")));
        }
        let attempt = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        match timeout(remaining, attempt).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => log::trace!(target: "client", "{endpoint} not ready: {e}"),
            Err(_) => {}
        }
        sleep(READY_PROBE_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
            .await;
    }
}
