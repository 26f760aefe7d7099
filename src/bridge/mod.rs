//! Bridge module - Control channel transports for UI processes

mod protocol;
mod stdio;

pub use stdio::StdioBridge;
