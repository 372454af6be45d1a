//! Linux kernel interfaces.

/// Whether a tracer is attached, per `/proc/self/status`.
pub fn is_debugged() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| tracer_pid(&status))
        .is_some_and(|pid| pid != 0)
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
