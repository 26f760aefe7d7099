//! Status broadcasting - The single owner of the engine status

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use super::events::{ControlEvent, EventSink};
use super::state::{EngineState, EngineStatus};

/// A lifecycle transition. Applying one is the only way to change the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Attached to a remote engine at `url`
    Remote { url: String },
    /// Local engine launched, endpoint not yet known
    Started,
    /// Local engine passed its health check at `url`
    Ready { url: String },
    /// Engine stopped; the last endpoint is kept
    Stopped,
}

impl Transition {
    pub fn target(&self) -> EngineState {
        match self {
            Self::Remote { .. } => EngineState::Remote,
            Self::Started => EngineState::Started,
            Self::Ready { .. } => EngineState::Ready,
            Self::Stopped => EngineState::Stopped,
        }
    }
}

/// Holds the current [`EngineStatus`] and publishes one
/// `ENGINE_STATUS_CHANGED` event per applied transition
pub struct StatusBroadcaster {
    status: EngineStatus,
    sink: Arc<dyn EventSink>,
    watch_tx: watch::Sender<EngineStatus>,
}

impl StatusBroadcaster {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let status = EngineStatus::initial();
        let (watch_tx, _rx) = watch::channel(status.clone());
        Self {
            status,
            sink,
            watch_tx,
        }
    }

    pub fn current(&self) -> &EngineStatus {
        &self.status
    }

    /// Snapshot receiver that always holds the latest status
    pub fn watch(&self) -> watch::Receiver<EngineStatus> {
        self.watch_tx.subscribe()
    }

    /// Apply a transition and publish it
    pub fn apply(&mut self, transition: Transition) {
        let previous = self.status.state;
        let state = transition.target();
        let endpoint = match transition {
            Transition::Remote { url } | Transition::Ready { url } => Some(url),
            Transition::Started => None,
            Transition::Stopped => self.status.endpoint.take(),
        };

        self.status = EngineStatus {
            state,
            endpoint,
            changed_at: Utc::now(),
        };
        info!(
            from = %previous,
            to = %state,
            endpoint = self.status.endpoint.as_deref().unwrap_or(""),
            "Engine status changed"
        );

        self.watch_tx.send_replace(self.status.clone());
        self.sink.publish(ControlEvent::StatusChanged {
            state,
            endpoint: state
                .publishes_endpoint()
                .then(|| self.status.endpoint.clone())
                .flatten(),
        });
    }
}
