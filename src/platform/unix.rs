//! Unix process signalling

use anyhow::Result;

/// Ask every process in the group led by `pid` to exit (SIGTERM)
pub fn terminate_process_group(pid: u32) -> Result<()> {
    signal_group(pid, libc::SIGTERM, "terminate")
}

/// Kill every process in the group led by `pid` (SIGKILL)
pub fn kill_process_group(pid: u32) -> Result<()> {
    signal_group(pid, libc::SIGKILL, "kill")
}

/// Check if a process is running
#[cfg(test)]
pub fn is_process_running(pid: u32) -> bool {
    unsafe {
        // kill with signal 0 checks if process exists without sending a signal
        libc::kill(pid as libc::pid_t, 0) == 0
    }
}

fn signal_group(pid: u32, signal: libc::c_int, action: &str) -> Result<()> {
    // A negative pid addresses the whole process group
    let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to {} process group {}: {}",
            action,
            pid,
            std::io::Error::last_os_error()
        )
    }
}
