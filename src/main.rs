//! sandbox-interface server binary.
//!
//! Starts the command endpoint with a dispatcher that logs every command,
//! then runs until Ctrl-C or until the network loop dies with a fatal error.

use bytes::Bytes;
use sandbox_interface::{CommandHeader, Config, Interface, PayloadTable};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the signal wait checks whether the network loop is still alive.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let interface_config = config.interface_config()?;
    info!(
        listen = %interface_config.listen,
        idle_timeout_secs = config.idle_timeout_secs,
        poll_interval_ms = config.poll_interval_ms,
        "Starting sandbox interface"
    );

    let mut interface = Interface::start(&interface_config, PayloadTable::default(), log_command)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_shutdown(&interface));

    if let Err(e) = interface.stop() {
        if e.is_fatal() {
            error!(error = %e, "Network loop failed");
        } else {
            warn!(error = %e, "Stop failed");
        }
        return Err(e.into());
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or as soon as the network loop has exited on its own.
async fn wait_for_shutdown(interface: &Interface) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut signals = true;
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c, if signals => match result {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    signals = false;
                }
            },
            _ = liveness.tick() => {
                if !interface.is_running() {
                    warn!("Network loop exited");
                    return;
                }
            }
        }
    }
}

fn log_command(header: &CommandHeader, payload: &[u8]) -> Option<Bytes> {
    match header.command() {
        Ok(opcode) => info!(?opcode, tag = header.tag, len = payload.len(), "Command received"),
        Err(e) => warn!(error = %e, "Command with unknown opcode"),
    }
    None
}
