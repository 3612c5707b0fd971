//! Stand-ins for the rotator daemon, shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::client::Endpoint;
use crate::config::ConnectionConfig;

/// Serves one command per connection; `reply` maps the request line to
/// the raw reply, or `None` to hold the connection open without answering.
pub async fn spawn_responder<F>(reply: F) -> (Endpoint, Arc<AtomicUsize>)
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    spawn_delayed_responder(Duration::ZERO, reply).await
}

/// Like [`spawn_responder`], but every reply is held back for `delay`.
/// The counter tracks accepted connections.
pub async fn spawn_delayed_responder<F>(delay: Duration, reply: F) -> (Endpoint, Arc<AtomicUsize>)
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let reply = Arc::new(reply);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let reply = Arc::clone(&reply);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.is_err() {
                    return;
                }
                match reply(line.trim()) {
                    Some(text) => {
                        sleep(delay).await;
                        let _ = reader.get_mut().write_all(text.as_bytes()).await;
                    }
                    None => sleep(Duration::from_secs(30)).await,
                }
            });
        }
    });
    (Endpoint::new("127.0.0.1", port), connections)
}

/// A rotator that reports back whatever it was last told.
pub async fn spawn_echo_rotator() -> (Endpoint, Arc<AtomicUsize>) {
    let last = Arc::new(Mutex::new((0.0_f64, 0.0_f64)));
    spawn_responder(move |req| {
        let mut last = last.lock().unwrap();
        let mut parts = req.split_whitespace();
        match parts.next() {
            Some("P") => {
                let mut value = || {
                    parts
                        .next()
                        .and_then(|v| v.parse::<f64>().ok())
                        .filter(|v| v.is_finite())
                };
                let az = value();
                let el = value();
                match (az, el) {
                    (Some(az), Some(el)) => {
                        *last = (az, el);
                        Some("RPRT 0\n".into())
                    }
                    _ => Some("RPRT -1\n".into()),
                }
            }
            Some("p") => Some(format!("{:.6}\n{:.6}\n", last.0, last.1)),
            _ => Some("RPRT -4\n".into()),
        }
    })
    .await
}

/// Writes an executable `/bin/sh` script named `rotctld` into `dir` and
/// returns a config whose search path finds it.
#[cfg(unix)]
pub fn fake_daemon(dir: &std::path::Path, body: &str) -> ConnectionConfig {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("rotctld");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    ConnectionConfig {
        executable_search_paths: vec![dir.to_path_buf()],
        stop_timeout_ms: 3000,
        ..ConnectionConfig::default()
    }
}
