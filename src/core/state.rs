//! Engine state - Lifecycle states of the supervised engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one run of an engine, so late notifications from an earlier
/// run can be told apart from the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Idle before the first start, or serving after a passed health check
    Ready,
    /// Local engine spawned, health check pending
    Started,
    /// Reserved for the renderer; the controller never enters it
    Starting,
    /// Attached to an externally supervised engine
    Remote,
    /// Engine stopped or exited
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Started => "started",
            Self::Starting => "starting",
            Self::Remote => "remote",
            Self::Stopped => "stopped",
        }
    }

    /// Whether a local engine process can exist in this state
    pub fn may_own_process(&self) -> bool {
        matches!(self, Self::Ready | Self::Started | Self::Starting)
    }

    /// Whether the endpoint is part of the status event payload
    pub fn publishes_endpoint(&self) -> bool {
        matches!(self, Self::Ready | Self::Remote)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the last known engine endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Base URL of the engine once known
    pub endpoint: Option<String>,
    /// When the state last changed
    pub changed_at: DateTime<Utc>,
}

impl EngineStatus {
    /// Status of a freshly constructed controller
    pub fn initial() -> Self {
        Self {
            state: EngineState::Ready,
            endpoint: None,
            changed_at: Utc::now(),
        }
    }

    /// `"{state}|{endpoint}"`, the reply to `GET_ENGINE_STATUS`
    pub fn status_line(&self) -> String {
        format!("{}|{}", self.state, self.endpoint.as_deref().unwrap_or(""))
    }

    /// Whether an engine run is in progress and a new start must be refused
    pub fn is_session_active(&self) -> bool {
        match self.state {
            EngineState::Started | EngineState::Starting | EngineState::Remote => true,
            EngineState::Ready => self.endpoint.is_some(),
            EngineState::Stopped => false,
        }
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::initial()
    }
}
