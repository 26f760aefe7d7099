//! EngineHost - Run and supervise the application engine for a desktop UI
//!
//! Starts the engine as a local child process (or points the UI at a remote
//! one), waits for it to become healthy, and serves the control channel to
//! the UI process over stdio.

mod bridge;
mod core;
mod platform;

use std::path::PathBuf;

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::StdioBridge;
use crate::core::{EngineHost, HostSettings, HttpHealthProbe};

/// Application name constant
pub const APP_NAME: &str = "EngineHost";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let settings = HostSettings::load(&HostSettings::default_path())?;

    // Initialize logging
    init_logging(settings.debug_logging);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Two hosts must never supervise the same engine
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        anyhow::bail!("Another instance of {} is already running", APP_NAME);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(run(settings));

    // A pending stdin read would otherwise hold shutdown until the next line
    runtime.shutdown_background();

    info!("{} shutting down", APP_NAME);
    result
}

async fn run(settings: HostSettings) -> Result<()> {
    let probe = HttpHealthProbe::new(settings.health_check_timeout())
        .context("Failed to create health check client")?;
    let (handle, host) = EngineHost::spawn(&settings, probe);

    // Initial start from the env file, if any
    match env_file(&settings) {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(env) => {
                info!("Starting engine from {:?}", path);
                if let Err(e) = handle.start_engine(env).await {
                    error!("Failed to start engine: {}", e);
                }
            }
            Err(e) => error!("Failed to read env file {:?}: {}", path, e),
        },
        None => info!("No env file given, waiting for ENGINE_START"),
    }

    let bridge = StdioBridge::new(handle.clone());
    tokio::select! {
        result = bridge.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            if let Err(e) = result {
                error!("Stdio bridge failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    handle.stop_engine().await?;
    drop(handle);
    host.await.context("Engine controller task failed")?;
    Ok(())
}

/// Env file from the command line, else from the settings
fn env_file(settings: &HostSettings) -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| settings.engine_env_file.clone())
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default_directive = if debug { "enginehost=debug" } else { "enginehost=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // stdout belongs to the stdio bridge
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
