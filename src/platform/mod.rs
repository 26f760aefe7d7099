//! Platform-specific process control

#[cfg(unix)]
mod unix;

use anyhow::Result;

/// Ask the engine's process group to exit, giving it a chance to clean up
pub fn terminate_process_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::terminate_process_group(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Graceful termination is not supported on this platform")
    }
}

/// Kill the engine's process group outright
pub fn kill_process_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_process_group(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Process groups are not supported on this platform")
    }
}

/// Check if a process is running
#[cfg(all(test, unix))]
pub fn is_process_running(pid: u32) -> bool {
    unix::is_process_running(pid)
}
