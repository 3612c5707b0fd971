use sysinfo::{ProcessesToUpdate, System};

/// Process ids of daemon instances already running on this host.
///
/// A stray daemon usually holds the serial device and the listen port, so
/// the supervisor reports each one before spawning its own. Only called
/// while this session supervises no live daemon. Blocking: scans every
/// process.
pub fn foreign_instances(binary_name: &str) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, false);

    let target = binary_name.to_lowercase();
    let self_pid = std::process::id();
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, p)| p.name().to_string_lossy().to_lowercase() == target)
        .map(|(pid, _)| pid.as_u32())
        .filter(|pid| *pid != self_pid)
        .collect();
    pids.sort_unstable();
    pids
}
