//! Errors surfaced by the engine controller

use std::io;

use thiserror::Error;

use super::config::ConfigError;
use super::state::EngineState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine is already {0}, stop it first")]
    AlreadyActive(EngineState),

    #[error("Failed to spawn engine {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Engine controller is no longer running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
