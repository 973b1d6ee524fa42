mod config;
mod descriptor;
mod store;
mod spawner;
mod listener;
mod registry;
mod reactor;
mod api;
#[cfg(test)]
mod testutil;

use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::descriptor::DescriptorSource;
use crate::listener::ServiceEvent;
use crate::reactor::{RegistryHandle, RegistryParts};
use crate::registry::RegistryOptions;
use crate::spawner::CommandSpawner;
use crate::store::db::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("activationd=info"))
        )
        .init();

    tracing::info!("Starting activationd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/activationd/activationd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open settings database
    let store = SqliteStore::open(&config.store.db_path)?;
    tracing::info!("Opened settings database at {:?}", config.store.db_path);

    let cancel = CancellationToken::new();

    // Notifier subscribes before the first load so startup events are seen
    let (events_tx, events_rx) = broadcast::channel(256);
    let notifier_cancel = cancel.clone();
    let notifier_handle = tokio::spawn(run_notifier(events_rx, notifier_cancel));

    // Start reactor thread; it owns every service socket
    let parts = RegistryParts {
        provider: Box::new(DescriptorSource::new(
            config.services.clone(),
            config.daemon.services_dir.clone(),
        )),
        store: Box::new(store),
        spawner: Box::new(CommandSpawner),
        options: RegistryOptions {
            bind_address: config.daemon.bind_address,
            expiration_margin: Duration::from_secs(config.daemon.expiration_margin_secs),
        },
        events: events_tx,
    };
    let (registry, reactor_thread) = RegistryHandle::spawn(parts, cancel.clone())?;

    // Build API router
    let app = api::routes::router(api::routes::AppState {
        registry: registry.clone(),
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Stop the reactor first so service ports close before the API goes away
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown reactor: {}", e);
    }
    cancel.cancel();

    let _ = tokio::join!(notifier_handle, server_handle);

    if !matches!(tokio::task::spawn_blocking(move || reactor_thread.join()).await, Ok(Ok(()))) {
        tracing::error!("Reactor thread panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log listener notifications until cancelled
async fn run_notifier(mut rx: broadcast::Receiver<ServiceEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(ServiceEvent::ConnectionObserved { service, peer }) => {
                    tracing::info!("{}: connection from {}", service, peer);
                }
                Ok(ServiceEvent::SpawnFailed { service, handler, argument, connection }) => {
                    tracing::error!("{}: call \"{} {} {}\" failed", service, handler, argument, connection);
                }
                Ok(ServiceEvent::ServiceUnavailable { service }) => {
                    tracing::warn!("{}: no port available, service disabled", service);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Notifier missed {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}
