//! Engine controller - The lifecycle state machine of the engine
//!
//! The controller is driven from a single task: control requests call
//! [`EngineController::start`] and [`EngineController::stop`], and the
//! background work it kicks off (health probing, process exit) reports back
//! as [`LifecycleEvent`]s handled by [`EngineController::handle_lifecycle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{EngineConfig, EngineMode, LocalEngine};
use super::error::{EngineError, Result};
use super::events::EventSink;
use super::health::{wait_until_healthy, HealthProbe, ProbeOutcome, RetryPolicy};
use super::process::{ExitReport, LaunchSpec, ProcessSupervisor};
use super::settings::HostSettings;
use super::state::{EngineState, EngineStatus, SessionId};
use super::status::{StatusBroadcaster, Transition};

/// Notification from work running beside the controller
#[derive(Debug)]
pub enum LifecycleEvent {
    ProbeFinished {
        session: SessionId,
        outcome: ProbeOutcome,
    },
    ProcessExited(ExitReport),
}

/// Tunables the controller takes from the host settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    pub engine_args: Vec<String>,
    pub stop_grace_period: Duration,
}

impl From<&HostSettings> for ControllerOptions {
    fn from(settings: &HostSettings) -> Self {
        Self {
            retry: settings.retry_policy(),
            engine_args: settings.engine_args.clone(),
            stop_grace_period: settings.stop_grace_period(),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&HostSettings::default())
    }
}

/// One engine run
struct EngineSession {
    id: SessionId,
    remote_url: String,
    probe_cancel: Option<CancellationToken>,
}

impl EngineSession {
    fn cancel_probe(&self) {
        if let Some(token) = &self.probe_cancel {
            token.cancel();
        }
    }
}

/// Starts, probes and stops the engine
pub struct EngineController<P: HealthProbe> {
    status: StatusBroadcaster,
    supervisor: ProcessSupervisor,
    probe: Arc<P>,
    options: ControllerOptions,
    session: Option<EngineSession>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl<P: HealthProbe> EngineController<P> {
    /// Create a controller in the `ready` state. The receiver yields the
    /// lifecycle events that must be fed back into [`Self::handle_lifecycle`].
    pub fn new(
        sink: Arc<dyn EventSink>,
        probe: P,
        options: ControllerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let controller = Self {
            status: StatusBroadcaster::new(sink.clone()),
            supervisor: ProcessSupervisor::new(sink, options.stop_grace_period),
            probe: Arc::new(probe),
            options,
            session: None,
            lifecycle_tx,
        };
        (controller, lifecycle_rx)
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.watch()
    }

    /// Parse `raw_env` and start the engine it describes. Configuration
    /// errors leave the controller untouched.
    pub fn start(&mut self, raw_env: &str) -> Result<()> {
        let config = EngineConfig::parse(raw_env)?;
        self.start_with(&config)
    }

    pub fn start_with(&mut self, config: &EngineConfig) -> Result<()> {
        let current = self.status.current();
        if current.is_session_active() {
            return Err(EngineError::AlreadyActive(current.state));
        }

        match config.mode()? {
            EngineMode::Remote { url } => {
                info!("Using remote engine at {}", url);
                self.session = None;
                self.status.apply(Transition::Remote { url });
            }
            EngineMode::Local(engine) => self.start_local(engine),
        }
        Ok(())
    }

    fn start_local(&mut self, engine: LocalEngine) {
        let session = SessionId::new();
        self.status.apply(Transition::Started);

        let spec = LaunchSpec {
            program: engine.engine_path,
            args: self.options.engine_args.clone(),
            working_dir: engine.working_dir,
            environment: engine.environment,
        };
        let exits = self.lifecycle_tx.clone();
        let spawned = self.supervisor.spawn(session, &spec, move |report| {
            let _ = exits.send(LifecycleEvent::ProcessExited(report));
        });
        if let Err(e) = spawned {
            error!("Error starting engine: {}", e);
            self.session = None;
            self.status.apply(Transition::Stopped);
            return;
        }

        let cancel = CancellationToken::new();
        let probe = Arc::clone(&self.probe);
        let policy = self.options.retry;
        let url = engine.remote_url.clone();
        let token = cancel.clone();
        let results = self.lifecycle_tx.clone();
        tokio::spawn(async move {
            let outcome = wait_until_healthy(&*probe, &url, policy, &token).await;
            let _ = results.send(LifecycleEvent::ProbeFinished { session, outcome });
        });

        self.session = Some(EngineSession {
            id: session,
            remote_url: engine.remote_url,
            probe_cancel: Some(cancel),
        });
    }

    /// Stop whatever engine is attached. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        if self.status.current().state == EngineState::Stopped {
            debug!("Engine already stopped");
            return;
        }

        if let Some(session) = self.session.take() {
            session.cancel_probe();
        }
        self.supervisor.stop().await;
        self.status.apply(Transition::Stopped);
    }

    /// React to a notification from a probe loop or process watcher
    pub fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ProbeFinished { session, outcome } => {
                if !self.is_current(session) {
                    debug!("Ignoring probe result of stale session {}", session);
                    return;
                }
                self.on_probe_finished(outcome);
            }
            LifecycleEvent::ProcessExited(report) => {
                self.supervisor.release(report.session);
                if report.requested || !self.is_current(report.session) {
                    return;
                }
                self.on_unexpected_exit(&report);
            }
        }
    }

    fn on_probe_finished(&mut self, outcome: ProbeOutcome) {
        let Some(session) = &mut self.session else {
            return;
        };
        session.probe_cancel = None;

        match outcome {
            ProbeOutcome::Healthy { attempts } => {
                if self.status.current().state != EngineState::Started {
                    return;
                }
                info!("Engine healthy after {} attempt(s)", attempts);
                let url = session.remote_url.clone();
                self.status.apply(Transition::Ready { url });
            }
            ProbeOutcome::Exhausted { attempts } => {
                warn!(
                    "Engine at {} still unhealthy after {} attempt(s), giving up",
                    session.remote_url, attempts
                );
            }
            ProbeOutcome::Cancelled => {}
        }
    }

    fn on_unexpected_exit(&mut self, report: &ExitReport) {
        warn!("Engine exited unexpectedly with {}", report.describe());
        if let Some(session) = self.session.take() {
            session.cancel_probe();
        }
        if self.status.current().state.may_own_process() {
            self.status.apply(Transition::Stopped);
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session)
    }
}

#[cfg(test)]
impl<P: HealthProbe> EngineController<P> {
    pub fn status(&self) -> &EngineStatus {
        self.status.current()
    }

    pub fn status_line(&self) -> String {
        self.status.current().status_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::testing::RecordingSink;
    use crate::core::events::ControlEvent;
    use crate::core::health::testing::ScriptedProbe;
    use crate::core::config::ConfigError;

    type Controller = EngineController<ScriptedProbe>;

    fn controller(
        probe: ScriptedProbe,
    ) -> (
        Controller,
        mpsc::UnboundedReceiver<LifecycleEvent>,
        Arc<RecordingSink>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let options = ControllerOptions {
            retry: RetryPolicy {
                interval: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            engine_args: vec!["start".to_string(), "--quickstart".to_string()],
            stop_grace_period: Duration::from_secs(2),
        };
        let (controller, rx) = EngineController::new(sink.clone(), probe, options);
        (controller, rx, sink)
    }

    fn status_event(state: EngineState, endpoint: Option<&str>) -> ControlEvent {
        ControlEvent::StatusChanged {
            state,
            endpoint: endpoint.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn remote_config_goes_straight_to_remote() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());

        controller
            .start("ENGINE_ENABLED=0\nREMOTE_URL=http://h:9/signin")
            .unwrap();

        assert_eq!(controller.status().state, EngineState::Remote);
        assert_eq!(controller.status_line(), "remote|http://h:9/signin");
        assert_eq!(
            sink.events(),
            vec![status_event(EngineState::Remote, Some("http://h:9/signin"))]
        );
        assert!(!controller.supervisor.has_child());
    }

    #[tokio::test]
    async fn invalid_config_leaves_state_untouched() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());

        let err = controller.start("ENGINE_ENABLED=0").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::RemoteUrlRequired)
        ));

        let err = controller
            .start("ENGINE_ENABLED=1\nENGINE_PATH=/bin/e")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::MissingEngineSettings { .. })
        ));

        assert_eq!(controller.status_line(), "ready|");
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());
        controller
            .start("ENGINE_ENABLED=0\nREMOTE_URL=http://x:1/signin")
            .unwrap();

        controller.stop().await;
        controller.stop().await;

        assert_eq!(controller.status().state, EngineState::Stopped);
        assert_eq!(
            sink.status_events(),
            vec![
                status_event(EngineState::Remote, Some("http://x:1/signin")),
                status_event(EngineState::Stopped, None),
            ]
        );
    }

    #[tokio::test]
    async fn stop_from_initial_ready_publishes_stopped() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());
        controller.stop().await;
        assert_eq!(sink.events(), vec![status_event(EngineState::Stopped, None)]);
    }

    #[tokio::test]
    async fn active_session_refuses_second_start() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());
        controller
            .start("ENGINE_ENABLED=0\nREMOTE_URL=http://x:1/signin")
            .unwrap();

        let err = controller
            .start("ENGINE_ENABLED=0\nREMOTE_URL=http://y:2/signin")
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActive(EngineState::Remote)));
        assert_eq!(controller.status_line(), "remote|http://x:1/signin");
        assert_eq!(sink.status_events().len(), 1);

        controller.stop().await;
        controller
            .start("ENGINE_ENABLED=0\nREMOTE_URL=http://y:2/signin")
            .unwrap();
        assert_eq!(controller.status_line(), "remote|http://y:2/signin");
    }

    #[tokio::test]
    async fn missing_engine_binary_ends_in_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            "ENGINE_ENABLED=1\nENGINE_PATH={}\nENGINE_WORKING_DIR={}\nAPP_PORT=3000",
            dir.path().join("no-such-engine").display(),
            dir.path().display()
        );
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());

        controller.start(&raw).unwrap();

        assert_eq!(controller.status().state, EngineState::Stopped);
        assert_eq!(
            sink.status_events(),
            vec![
                status_event(EngineState::Started, None),
                status_event(EngineState::Stopped, None),
            ]
        );
    }

    #[tokio::test]
    async fn stale_probe_results_are_ignored() {
        let (mut controller, _rx, sink) = controller(ScriptedProbe::never_healthy());
        controller.handle_lifecycle(LifecycleEvent::ProbeFinished {
            session: SessionId::new(),
            outcome: ProbeOutcome::Healthy { attempts: 1 },
        });
        assert_eq!(controller.status_line(), "ready|");
        assert!(sink.events().is_empty());
    }

    #[cfg(unix)]
    mod local_engine {
        use super::*;

        /// The engine runs as `/bin/sh start --quickstart` with the script in
        /// the working directory
        fn local_env(dir: &tempfile::TempDir, script: &str) -> String {
            std::fs::write(dir.path().join("start"), script).unwrap();
            format!(
                "ENGINE_ENABLED=1\nENGINE_PATH=/bin/sh\nENGINE_WORKING_DIR={}\nAPP_PORT=3000",
                dir.path().display()
            )
        }

        async fn next_lifecycle(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("lifecycle event in time")
                .expect("lifecycle channel open")
        }

        #[tokio::test]
        async fn healthy_engine_becomes_ready() {
            let dir = tempfile::tempdir().unwrap();
            let raw = local_env(&dir, "echo \"$NODE_MODULES_PATH\"\nexec sleep 30\n");
            let (mut controller, mut rx, sink) = controller(ScriptedProbe::healthy_after(2));

            controller.start(&raw).unwrap();
            assert_eq!(controller.status_line(), "started|");
            assert!(controller.supervisor.has_child());

            let event = next_lifecycle(&mut rx).await;
            assert!(matches!(
                event,
                LifecycleEvent::ProbeFinished {
                    outcome: ProbeOutcome::Healthy { attempts: 3 },
                    ..
                }
            ));
            controller.handle_lifecycle(event);
            assert_eq!(controller.status_line(), "ready|http://localhost:3000/signin");

            controller.stop().await;
            assert!(!controller.supervisor.has_child());
            assert_eq!(
                sink.status_events(),
                vec![
                    status_event(EngineState::Started, None),
                    status_event(EngineState::Ready, Some("http://localhost:3000/signin")),
                    status_event(EngineState::Stopped, None),
                ]
            );

            let modules = dir.path().join("plugins").join("node_modules");
            assert!(sink
                .events()
                .contains(&ControlEvent::Stdout(format!("{}\n", modules.display()))));

            // The requested exit arrives afterwards and changes nothing
            let event = next_lifecycle(&mut rx).await;
            controller.handle_lifecycle(event);
            assert_eq!(sink.status_events().len(), 3);
        }

        #[tokio::test]
        async fn unexpected_exit_stops_engine() {
            let dir = tempfile::tempdir().unwrap();
            let raw = local_env(&dir, "exit 1\n");
            let (mut controller, mut rx, sink) = controller(ScriptedProbe::never_healthy());

            controller.start(&raw).unwrap();
            let event = next_lifecycle(&mut rx).await;
            assert!(matches!(event, LifecycleEvent::ProcessExited(_)));
            controller.handle_lifecycle(event);

            assert_eq!(controller.status().state, EngineState::Stopped);
            assert_eq!(
                sink.status_events(),
                vec![
                    status_event(EngineState::Started, None),
                    status_event(EngineState::Stopped, None),
                ]
            );

            // The cancelled probe reports back but is ignored
            let event = next_lifecycle(&mut rx).await;
            assert!(matches!(
                event,
                LifecycleEvent::ProbeFinished {
                    outcome: ProbeOutcome::Cancelled,
                    ..
                }
            ));
            controller.handle_lifecycle(event);
            assert_eq!(sink.status_events().len(), 2);
        }

        #[tokio::test]
        async fn engine_exiting_after_ready_stops() {
            let dir = tempfile::tempdir().unwrap();
            let raw = local_env(&dir, "sleep 0.5\nexit 0\n");
            let (mut controller, mut rx, sink) = controller(ScriptedProbe::healthy_after(0));

            controller.start(&raw).unwrap();

            let event = next_lifecycle(&mut rx).await;
            assert!(matches!(
                event,
                LifecycleEvent::ProbeFinished {
                    outcome: ProbeOutcome::Healthy { attempts: 1 },
                    ..
                }
            ));
            controller.handle_lifecycle(event);
            assert_eq!(controller.status_line(), "ready|http://localhost:3000/signin");

            let event = next_lifecycle(&mut rx).await;
            match &event {
                LifecycleEvent::ProcessExited(report) => assert!(!report.requested),
                other => panic!("expected the engine to exit, got {other:?}"),
            }
            controller.handle_lifecycle(event);

            assert_eq!(controller.status_line(), "stopped|http://localhost:3000/signin");
            assert!(!controller.supervisor.has_child());
            assert_eq!(
                sink.status_events(),
                vec![
                    status_event(EngineState::Started, None),
                    status_event(EngineState::Ready, Some("http://localhost:3000/signin")),
                    status_event(EngineState::Stopped, None),
                ]
            );
        }

        #[tokio::test]
        async fn stop_while_probing_cancels_probe() {
            let dir = tempfile::tempdir().unwrap();
            let raw = local_env(&dir, "exec sleep 30\n");
            let (mut controller, mut rx, sink) = controller(ScriptedProbe::never_healthy());

            controller.start(&raw).unwrap();
            controller.stop().await;

            assert_eq!(controller.status().state, EngineState::Stopped);
            for _ in 0..2 {
                let event = next_lifecycle(&mut rx).await;
                match &event {
                    LifecycleEvent::ProbeFinished { outcome, .. } => {
                        assert_eq!(*outcome, ProbeOutcome::Cancelled)
                    }
                    LifecycleEvent::ProcessExited(report) => assert!(report.requested),
                }
                controller.handle_lifecycle(event);
            }
            assert_eq!(sink.status_events().len(), 2);
        }
    }
}
