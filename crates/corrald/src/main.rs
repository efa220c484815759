//! corrald - container supervisor daemon.
//!
//! Serves the control protocol on a unix or TCP socket and supervises
//! containers through the corral backend. Containers outlive the daemon;
//! a restarted daemon restores them from their snapshots.

use std::sync::Arc;

use clap::Parser;
use corral::LinuxBackend;
use corral_network::{DisabledController, IptablesController, NetworkController};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bomberman;
mod config;
mod drain;
mod protocol;
mod server;

use config::{Args, DaemonConfig, LogFormat};
use server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load(Args::parse())?;
    init_tracing(config.log_format);

    let network: Arc<dyn NetworkController> = if config.disable_network_rules {
        tracing::warn!("Network rules disabled");
        Arc::new(DisabledController)
    } else {
        Arc::new(IptablesController::new())
    };

    let backend = Arc::new(LinuxBackend::new(config.backend()?, network)?);
    let mut events = backend.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(?event, "Container event"),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Container event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = Server::new(backend, config.listen());
    server.start().await?;
    tracing::info!("corrald started");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = interrupt.recv() => tracing::info!("Received SIGINT"),
        _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        _ = hangup.recv() => tracing::info!("Received SIGHUP"),
    }

    server.stop().await;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    ));
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
