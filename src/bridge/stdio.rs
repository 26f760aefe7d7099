//! Stdio bridge - Serving the control channel over JSON lines

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{BridgeCommand, BridgeFrame, BridgeRequest, Reply};
use crate::core::{ControlEvent, ControlHandle};

/// Connects a UI process to the control channel. Requests arrive one per
/// line and are served in order; control events are forwarded as they are
/// published.
pub struct StdioBridge {
    handle: ControlHandle,
}

impl StdioBridge {
    pub fn new(handle: ControlHandle) -> Self {
        Self { handle }
    }

    /// Serve until `reader` reaches EOF, then flush every pending frame
    pub async fn run<R, W>(self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, frames_rx));

        let stop = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            self.handle.subscribe(),
            frames_tx.clone(),
            stop.clone(),
        ));

        info!("Bridge serving control channel");
        let served = self.serve(reader, &frames_tx).await;

        stop.cancel();
        if let Err(e) = forwarder.await {
            error!("Bridge event forwarder failed: {}", e);
        }
        drop(frames_tx);
        let written = writer_task.await.map_err(io::Error::other)?;

        info!("Bridge closed");
        served.and(written)
    }

    async fn serve<R>(&self, reader: R, frames: &mpsc::UnboundedSender<BridgeFrame>) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(reply) = self.handle_line(&line).await {
                if frames.send(BridgeFrame::Reply(reply)).is_err() {
                    warn!("Bridge output closed, no longer serving requests");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> Option<Reply> {
        let request: BridgeRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed bridge request: {}", e);
                return Some(Reply::failure(None, format!("malformed request: {e}")));
            }
        };

        let BridgeRequest { id, command } = request;
        debug!("Bridge request {:?} on {}", id, command.channel());

        let outcome = match command {
            BridgeCommand::GetEngineStatus => Ok(Some(self.handle.engine_status())),
            BridgeCommand::EngineStart { env } => self.handle.start_engine(env).await.map(|()| None),
            BridgeCommand::EngineStop => self.handle.stop_engine().await.map(|()| None),
            BridgeCommand::ReloadWindow => {
                self.handle.reload_window();
                Ok(None)
            }
        };

        match outcome {
            Ok(value) => id.map(|id| Reply::success(Some(id), value)),
            Err(e) => {
                warn!("Bridge request {:?} failed: {}", id, e);
                Some(Reply::failure(id, e.to_string()))
            }
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<ControlEvent>,
    frames: mpsc::UnboundedSender<BridgeFrame>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    if frames.send(BridgeFrame::from(&event)).is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Bridge fell behind, {} control events dropped", skipped);
                }
                Err(RecvError::Closed) => return,
            },
            _ = stop.cancelled() => break,
        }
    }

    // Events published before shutdown still go out
    loop {
        match events.try_recv() {
            Ok(event) => {
                if frames.send(BridgeFrame::from(&event)).is_err() {
                    return;
                }
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Bridge fell behind, {} control events dropped", skipped);
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return,
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<BridgeFrame>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
