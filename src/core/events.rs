//! Control channel events - What the engine host tells the UI
//!
//! The controller only depends on [`EventSink`]; [`EventBus`] is the
//! in-process implementation over [`tokio::sync::broadcast`]. Publishing never
//! blocks, and events sent while nobody is subscribed are dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::state::EngineState;

/// Channel names shared with the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpcChannel {
    GetEngineStatus,
    EngineStart,
    EngineStop,
    EngineStatusChanged,
    EngineStdout,
    EngineStderr,
    ReloadWindow,
}

impl IpcChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetEngineStatus => "GET_ENGINE_STATUS",
            Self::EngineStart => "ENGINE_START",
            Self::EngineStop => "ENGINE_STOP",
            Self::EngineStatusChanged => "ENGINE_STATUS_CHANGED",
            Self::EngineStdout => "ENGINE_STDOUT",
            Self::EngineStderr => "ENGINE_STDERR",
            Self::ReloadWindow => "RELOAD_WINDOW",
        }
    }
}

impl fmt::Display for IpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fire-and-forget notification on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The engine changed state
    StatusChanged {
        state: EngineState,
        endpoint: Option<String>,
    },
    /// A chunk of engine stdout
    Stdout(String),
    /// A chunk of engine stderr
    Stderr(String),
    /// Ask the window layer to reload
    ReloadWindow,
}

impl ControlEvent {
    pub fn channel(&self) -> IpcChannel {
        match self {
            Self::StatusChanged { .. } => IpcChannel::EngineStatusChanged,
            Self::Stdout(_) => IpcChannel::EngineStdout,
            Self::Stderr(_) => IpcChannel::EngineStderr,
            Self::ReloadWindow => IpcChannel::ReloadWindow,
        }
    }

    /// Payload as the renderer receives it
    pub fn payload(&self) -> Vec<String> {
        match self {
            Self::StatusChanged { state, endpoint } => {
                let mut payload = vec![state.to_string()];
                payload.extend(endpoint.clone());
                payload
            }
            Self::Stdout(chunk) | Self::Stderr(chunk) => vec![chunk.clone()],
            Self::ReloadWindow => Vec::new(),
        }
    }
}

/// Somewhere control events can be published to
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ControlEvent);
}

/// Broadcast bus for control events
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    /// Create a bus buffering at most `capacity` events per lagging receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: ControlEvent) {
        // No receivers is not an error
        let _ = self.tx.send(event);
    }
}
