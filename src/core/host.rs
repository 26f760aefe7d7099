//! Control channel - Serving UI requests against the engine controller
//!
//! [`EngineHost`] runs the controller on one task and serves requests one at
//! a time, interleaved with lifecycle notifications. [`ControlHandle`] is the
//! cloneable client end held by the UI side.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::controller::{ControllerOptions, EngineController, LifecycleEvent};
use super::error::{EngineError, Result};
use super::events::{ControlEvent, EventBus, EventSink};
use super::health::HealthProbe;
use super::settings::HostSettings;
use super::state::EngineStatus;
#[cfg(test)]
use super::state::EngineState;

const REQUEST_QUEUE: usize = 32;

/// Requests that need the controller task
enum ControlRequest {
    Start {
        env: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Client end of the control channel
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
    status: watch::Receiver<EngineStatus>,
    bus: EventBus,
}

impl ControlHandle {
    /// `GET_ENGINE_STATUS`: answered from the latest snapshot without waiting
    /// on the controller
    pub fn engine_status(&self) -> String {
        self.status.borrow().status_line()
    }

    /// `ENGINE_START`: resolves once the start transition happened
    pub async fn start_engine(&self, env: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::Start {
            env: env.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// `ENGINE_STOP`: resolves once the engine is stopped
    pub async fn stop_engine(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::Stop { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Broadcast `RELOAD_WINDOW` to the window layer
    pub fn reload_window(&self) {
        self.bus.publish(ControlEvent::ReloadWindow);
    }

    /// Receive every control event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.bus.subscribe()
    }

    async fn send(&self, request: ControlRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

#[cfg(test)]
impl ControlHandle {
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Wait until the engine reaches `state`
    pub async fn wait_for(&self, state: EngineState) -> Result<EngineStatus> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reached.clone())
    }
}

/// Owns the engine controller and serves the control channel
pub struct EngineHost<P: HealthProbe> {
    controller: EngineController<P>,
    lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
    requests: mpsc::Receiver<ControlRequest>,
}

impl<P: HealthProbe> EngineHost<P> {
    /// Start the controller task. It runs until every [`ControlHandle`] is
    /// dropped, then stops the engine.
    pub fn spawn(settings: &HostSettings, probe: P) -> (ControlHandle, JoinHandle<()>) {
        let bus = EventBus::new(settings.event_capacity);
        let sink: Arc<dyn EventSink> = Arc::new(bus.clone());
        let (controller, lifecycle) =
            EngineController::new(sink, probe, ControllerOptions::from(settings));
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);

        let handle = ControlHandle {
            requests: requests_tx,
            status: controller.watch_status(),
            bus,
        };
        let host = Self {
            controller,
            lifecycle,
            requests,
        };
        (handle, tokio::spawn(host.run()))
    }

    async fn run(mut self) {
        info!("Engine controller running");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = self.lifecycle.recv() => self.controller.handle_lifecycle(event),
            }
        }

        info!("Control channel closed, shutting down engine");
        self.controller.stop().await;
    }

    async fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Start { env, reply } => {
                debug!("Handling ENGINE_START");
                let _ = reply.send(self.controller.start(&env));
            }
            ControlRequest::Stop { reply } => {
                debug!("Handling ENGINE_STOP");
                self.controller.stop().await;
                let _ = reply.send(());
            }
        }
    }
}
