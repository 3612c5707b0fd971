use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use rotor_control::client::{self, Endpoint};
use rotor_control::config::{self, ConnectionConfig};
use rotor_control::error::RotorError;
use rotor_control::console::{self, ConsoleCommand};
use rotor_control::event::SupervisorEvent;
use rotor_control::poller::PollState;
use rotor_control::session::{Session, DEFAULT_READY_TIMEOUT};
use rotor_control::{paths, ports, status, supervisor};

/// Output lines shown by `status`.
const STATUS_OUTPUT_LINES: usize = 10;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        log::error!(target: "config", "{e:#} (using defaults)");
        ConnectionConfig::default()
    });
    let status_path = paths::status_file_path(&config_path);

    // ── Channels and background tasks ─────────────────────────────────────────
    let (log_tx, log_rx) = supervisor::log_sink();
    let (poll_tx, mut poll_rx) = mpsc::channel::<PollState>(16);
    let (config_tx, mut config_rx) = mpsc::channel::<ConnectionConfig>(4);
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let (exit_tx, mut exit_rx) = mpsc::channel::<()>(4);
    let (ready_tx, mut ready_rx) = mpsc::channel::<(Endpoint, Result<(), RotorError>)>(4);

    // Daemon output is printed on its own task so a busy main loop never
    // backs up the supervisor.
    let printer = tokio::spawn(print_supervisor_events(log_rx, exit_tx));
    tokio::spawn(config::watch_config(config_path.clone(), config_tx));
    tokio::spawn(read_console_lines(line_tx));

    let mut session = Session::new(initial_config, Some(config_path), log_tx, poll_tx);
    session.refresh_ports();
    status::write_status(&status_path, &session.status());

    println!("rotor-control v{} ready, type 'help' for commands", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_readout = String::new();

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else {
                    log::info!(target: "console", "Input closed");
                    break;
                };
                match console::parse_command(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(cmd)) => run_command(&mut session, cmd, &ready_tx).await,
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }

            Some(()) = exit_rx.recv() => {
                // Nothing left to poll.
                session.stop_polling().await;
            }

            Some((endpoint, ready)) = ready_rx.recv() => {
                // A later stop or restart makes this answer stale.
                let current = session.daemon_state().is_active() && session.endpoint() == endpoint;
                match ready {
                    Ok(()) if current => session.start_polling(),
                    Ok(()) => {}
                    Err(e) => println!("daemon not accepting commands: {e}"),
                }
            }

            Some(state) = poll_rx.recv() => {
                let readout = console::render_poll_state(&state);
                if readout != last_readout {
                    println!("{readout}");
                    last_readout = readout;
                }
            }

            Some(new_config) = config_rx.recv() => {
                log::info!(target: "config", "Config reloaded");
                session.update_config(new_config);
            }

            result = &mut ctrl_c => {
                if let Err(e) = result {
                    log::error!(target: "console", "Ctrl+C handler failed: {e}");
                }
                break;
            }
        }
        status::write_status(&status_path, &session.status());
    }

    println!("Shutting down");
    session.shutdown().await;
    status::write_status(&status_path, &session.status());

    // Let the printer flush the last daemon events.
    drop(session);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        log::debug!(target: "console", "Event printer still busy at exit");
    }
}

async fn run_command(
    session: &mut Session,
    cmd: ConsoleCommand,
    ready_tx: &mpsc::Sender<(Endpoint, Result<(), RotorError>)>,
) {
    match cmd {
        ConsoleCommand::Ports => {
            session.refresh_ports();
            println!(
                "{}",
                console::render_ports(&ports::list_port_details(), &session.config().device)
            );
        }

        ConsoleCommand::Device(path) => {
            session.set_device(path);
            println!("device: {}", session.config().device);
        }

        // The readiness wait runs off the event loop and reports back.
        ConsoleCommand::Start => match session.launch_daemon().await {
            Ok(endpoint) => {
                println!("daemon starting on {endpoint}");
                if session.config().poll_on_start {
                    let tx = ready_tx.clone();
                    tokio::spawn(async move {
                        let ready = client::wait_until_accepting(&endpoint, DEFAULT_READY_TIMEOUT).await;
                        let _ = tx.send((endpoint, ready)).await;
                    });
                }
            }
            Err(e) => println!("start: {e}"),
        },

        ConsoleCommand::Stop => {
            if let Err(e) = session.stop_daemon().await {
                println!("stop: {e}");
            }
        }

        ConsoleCommand::Set { azimuth, elevation } => {
            if let Err(e) = session.set_position(azimuth, elevation).await {
                println!("set: {e}");
            }
        }

        ConsoleCommand::Get => match session.get_position().await {
            Ok(p) => {
                let n = p.normalized();
                println!("{n} ({})", n.compass_point());
            }
            Err(e) => println!("get: {e}"),
        },

        ConsoleCommand::Poll(true) => {
            if !session.daemon_state().is_active() {
                println!("poll: daemon is not running, polling anyway");
            }
            session.start_polling();
        }
        ConsoleCommand::Poll(false) => session.stop_polling().await,

        ConsoleCommand::Status => {
            let s = session.status();
            let pid = s.pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
            println!("daemon:   {}{pid}", s.daemon_state);
            println!("endpoint: {}", s.endpoint);
            println!("device:   {}", s.device);
            println!("polling:  {}", if s.polling { "on" } else { "off" });
            if let Some(state) = session.poll_state() {
                println!("position: {}", console::render_poll_state(&state));
            }
            if let Some(handle) = session.supervisor().handle() {
                println!("binary:   {}", handle.executable().display());
                println!("output:   {} line(s)", handle.output_total());
                let lines = handle.output_snapshot();
                for line in lines.iter().skip(lines.len().saturating_sub(STATUS_OUTPUT_LINES)) {
                    println!("  [{}] {}", line.stream, line.text);
                }
            }
        }

        ConsoleCommand::Save => {
            if let Err(e) = session.save_config() {
                println!("save: {e:#}");
            }
        }

        ConsoleCommand::Help => println!("{}", console::HELP),

        ConsoleCommand::Quit => {}
    }
}

/// Prints every supervisor event with a local timestamp and reports
/// unexpected exits back to the event loop.
async fn print_supervisor_events(
    mut rx: mpsc::Receiver<SupervisorEvent>,
    exit_tx: mpsc::Sender<()>,
) {
    while let Some(event) = rx.recv().await {
        let time = chrono::Local::now().format("%H:%M:%S");
        match &event {
            SupervisorEvent::Output(line) => println!("{time} [{}] {}", line.stream, line.text),
            SupervisorEvent::UnexpectedExit { .. } => {
                println!("{time} {event}");
                let _ = exit_tx.try_send(());
            }
            _ => println!("{time} {event}"),
        }
    }
}

async fn read_console_lines(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::error!(target: "console", "Failed to read input: {e}");
                break;
            }
        }
    }
}
