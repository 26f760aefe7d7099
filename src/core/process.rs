//! Process management - Spawning and supervising the engine process

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{EngineError, Result};
use super::events::{ControlEvent, EventSink};
use super::state::SessionId;
use crate::platform;

const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

/// How long output readers may drain after the engine is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to run for a local engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Layered over the host's own environment
    pub environment: Vec<(String, String)>,
}

/// Which pipe an output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn event(self, chunk: String) -> ControlEvent {
        match self {
            Self::Stdout => ControlEvent::Stdout(chunk),
            Self::Stderr => ControlEvent::Stderr(chunk),
        }
    }
}

/// How an engine process ended
#[derive(Debug)]
pub struct ExitReport {
    pub session: SessionId,
    pub status: std::io::Result<ExitStatus>,
    /// Whether the exit was asked for through [`ProcessSupervisor::stop`]
    pub requested: bool,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        match &self.status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown status ({e})"),
        }
    }
}

/// Handle to the running engine. Only the supervisor holds it.
struct ProcessHandle {
    session: SessionId,
    shutdown: CancellationToken,
    watcher: JoinHandle<()>,
    output: Vec<JoinHandle<()>>,
}

/// Owns the engine child process
pub struct ProcessSupervisor {
    sink: Arc<dyn EventSink>,
    grace_period: Duration,
    current: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(sink: Arc<dyn EventSink>, grace_period: Duration) -> Self {
        Self {
            sink,
            grace_period,
            current: None,
        }
    }

    /// Spawn the engine. Its output is forwarded to the event sink and
    /// `on_exit` runs once the process is gone, whatever the reason.
    pub fn spawn<F>(&mut self, session: SessionId, spec: &LaunchSpec, on_exit: F) -> Result<Option<u32>>
    where
        F: FnOnce(ExitReport) + Send + 'static,
    {
        if let Some(handle) = &self.current {
            warn!(
                "Replacing handle of engine session {} that was never released",
                handle.session
            );
        }

        info!(
            "Spawning engine {:?} {:?} in {:?}",
            spec.program, spec.args, spec.working_dir
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so stopping reaches everything the engine started
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        info!("Spawned engine with PID {:?}", pid);

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(tokio::spawn(forward_output(
                stdout,
                OutputStream::Stdout,
                self.sink.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(tokio::spawn(forward_output(
                stderr,
                OutputStream::Stderr,
                self.sink.clone(),
            )));
        }

        let shutdown = CancellationToken::new();
        let watcher = tokio::spawn(watch_process(
            child,
            session,
            shutdown.clone(),
            self.grace_period,
            on_exit,
        ));

        self.current = Some(ProcessHandle {
            session,
            shutdown,
            watcher,
            output,
        });
        Ok(pid)
    }

    /// Terminate the engine and wait until it is reaped. Output it wrote
    /// before exiting is published before this returns. Does nothing when no
    /// engine is running.
    pub async fn stop(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };

        info!("Stopping engine session {}", handle.session);
        handle.shutdown.cancel();
        if let Err(e) = handle.watcher.await {
            error!("Engine watcher task failed: {}", e);
        }

        for mut reader in handle.output {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                debug!("Engine output still open after stop, discarding the rest");
                reader.abort();
            }
        }
    }

    /// Forget the handle of a session whose process already exited
    pub fn release(&mut self, session: SessionId) {
        if self.current.as_ref().is_some_and(|h| h.session == session) {
            self.current = None;
        }
    }
}

#[cfg(test)]
impl ProcessSupervisor {
    pub fn has_child(&self) -> bool {
        self.current.is_some()
    }
}

async fn watch_process<F>(
    mut child: Child,
    session: SessionId,
    shutdown: CancellationToken,
    grace_period: Duration,
    on_exit: F,
) where
    F: FnOnce(ExitReport),
{
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = shutdown.cancelled() => (terminate(&mut child, grace_period).await, true),
    };

    let report = ExitReport {
        session,
        status,
        requested,
    };
    info!("Engine exited with {}", report.describe());
    on_exit(report);
}

/// Ask the engine's process group to exit, then kill it if the engine
/// outlives the grace period
async fn terminate(child: &mut Child, grace_period: Duration) -> std::io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };

    match platform::terminate_process_group(pid) {
        Ok(()) => {
            if let Ok(status) = tokio::time::timeout(grace_period, child.wait()).await {
                // Helpers that ignored SIGTERM go down with the group
                if let Err(e) = platform::kill_process_group(pid) {
                    debug!("Engine process group already gone: {}", e);
                }
                return status;
            }
            warn!(
                "Engine did not exit within {:?}, forcing kill",
                grace_period
            );
        }
        Err(e) => warn!("Graceful termination failed: {}, forcing kill", e),
    }

    if let Err(e) = platform::kill_process_group(pid) {
        debug!("Failed to kill engine process group: {}", e);
    }
    child.kill().await?;
    child.wait().await
}

async fn forward_output<R>(mut reader: R, stream: OutputStream, sink: Arc<dyn EventSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    // Bytes of a character split across two reads
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let complete = complete_utf8_len(&pending);
                if complete == 0 {
                    continue;
                }
                let chunk = String::from_utf8_lossy(&pending[..complete]).into_owned();
                pending.drain(..complete);
                publish_output(&*sink, stream, chunk);
            }
            Err(e) => {
                warn!("Failed to read engine {:?}: {}", stream, e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        publish_output(&*sink, stream, String::from_utf8_lossy(&pending).into_owned());
    }
}

fn publish_output(sink: &dyn EventSink, stream: OutputStream, chunk: String) {
    debug!(target: "enginehost::engine_output", "{:?}: {}", stream, chunk.trim_end());
    sink.publish(stream.event(chunk));
}

/// Length of `bytes` without a trailing UTF-8 sequence that is still missing
/// continuation bytes
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}
