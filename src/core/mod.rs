//! Core module - Engine configuration, lifecycle control, and the control channel

mod config;
mod controller;
mod error;
mod events;
pub mod health;
mod host;
mod process;
mod settings;
pub mod state;
mod status;

pub use events::{ControlEvent, IpcChannel};
pub use health::HttpHealthProbe;
pub use host::{ControlHandle, EngineHost};
pub use settings::HostSettings;
