//! JSON-lines wire format of the control channel

use serde::{Deserialize, Serialize};

use crate::core::{ControlEvent, IpcChannel};

/// One line read from the UI process
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeRequest {
    /// Requests without an id only get a reply when they fail
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "channel", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeCommand {
    GetEngineStatus,
    EngineStart { env: String },
    EngineStop,
    ReloadWindow,
}

impl BridgeCommand {
    pub fn channel(&self) -> IpcChannel {
        match self {
            Self::GetEngineStatus => IpcChannel::GetEngineStatus,
            Self::EngineStart { .. } => IpcChannel::EngineStart,
            Self::EngineStop => IpcChannel::EngineStop,
            Self::ReloadWindow => IpcChannel::ReloadWindow,
        }
    }
}

/// Answer to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn success(id: Option<u64>, value: Option<String>) -> Self {
        Self {
            id,
            ok: true,
            value,
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

/// One line written to the UI process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BridgeFrame {
    Reply(Reply),
    Event {
        channel: IpcChannel,
        payload: Vec<String>,
    },
}

impl From<&ControlEvent> for BridgeFrame {
    fn from(event: &ControlEvent) -> Self {
        Self::Event {
            channel: event.channel(),
            payload: event.payload(),
        }
    }
}
