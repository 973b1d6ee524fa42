use std::thread;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::types::ServiceStatus;
use crate::descriptor::DescriptorProvider;
use crate::listener::ServiceEvent;
use crate::registry::{RegistryOptions, ServiceRegistry};
use crate::spawner::ProcessSpawner;
use crate::store::ConfigStore;

/// Commands sent to the reactor thread
pub enum RegistryCommand {
    Services(oneshot::Sender<Vec<ServiceStatus>>),
    Status(String, oneshot::Sender<ServiceStatus>),
    SetEnabled {
        service: String,
        enabled: bool,
        reply: oneshot::Sender<ServiceStatus>,
    },
    EnableUntil {
        service: String,
        expiration: DateTime<Utc>,
        reply: oneshot::Sender<ServiceStatus>,
    },
    Reload(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// Collaborators the reactor thread builds its registry from
pub struct RegistryParts {
    pub provider: Box<dyn DescriptorProvider>,
    pub store: Box<dyn ConfigStore>,
    pub spawner: Box<dyn ProcessSpawner>,
    pub options: RegistryOptions,
    pub events: broadcast::Sender<ServiceEvent>,
}

/// Handle to interact with the service registry
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    events: broadcast::Sender<ServiceEvent>,
}

impl RegistryHandle {
    /// Spawn the reactor thread. It owns the registry, every listening
    /// socket and the expiration timer, and serves commands until shutdown
    /// or cancellation. Returns once the initial load has completed.
    pub fn spawn(parts: RegistryParts, cancel: CancellationToken) -> Result<(Self, thread::JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel::<RegistryCommand>(256);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let events = parts.events.clone();

        let join = thread::Builder::new()
            .name("activationd-reactor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!(e).context("Failed to build reactor runtime")));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut registry = ServiceRegistry::new(
                        parts.provider,
                        parts.store,
                        parts.spawner,
                        parts.options,
                        parts.events,
                    );
                    registry.load();
                    let _ = ready_tx.send(Ok(()));
                    run(registry, rx, cancel).await;
                });
            })
            .context("Failed to spawn reactor thread")?;

        ready_rx
            .recv()
            .context("Reactor thread exited during startup")??;

        Ok((Self { tx, events }, join))
    }

    /// Subscribe to listener notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Status of every registered service, in registration order
    pub async fn services(&self) -> Result<Vec<ServiceStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Services(reply)).await?;
        Ok(rx.await?)
    }

    /// Status of one service; unknown ids report as not installed
    pub async fn status(&self, service: String) -> Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Status(service, reply)).await?;
        Ok(rx.await?)
    }

    /// Enable or disable a service indefinitely
    pub async fn set_enabled(&self, service: String, enabled: bool) -> Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::SetEnabled { service, enabled, reply }).await?;
        Ok(rx.await?)
    }

    /// Enable a service until the given time
    pub async fn enable_until(&self, service: String, expiration: DateTime<Utc>) -> Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::EnableUntil { service, expiration, reply }).await?;
        Ok(rx.await?)
    }

    /// Rebuild all listeners from the current descriptors
    pub async fn reload(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Reload(reply)).await?;
        Ok(rx.await?)
    }

    /// Stop the reactor thread; all listening sockets are closed
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

/// Resolves on the next SIGCHLD; never when the signal could not be hooked
async fn child_exited(sigchld: &mut Option<Signal>) -> Option<()> {
    match sigchld {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

/// Reactor event loop. Interleaves admin commands, inbound connections on
/// every bound listener, the expiration wakeup and handler exits on one
/// thread.
pub async fn run(
    mut registry: ServiceRegistry,
    mut rx: mpsc::Receiver<RegistryCommand>,
    cancel: CancellationToken,
) {
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!("Cannot watch handler exits, reaping on activity only: {}", e);
            None
        }
    };

    loop {
        let wakeup = registry.wakeup();

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(RegistryCommand::Services(reply)) => {
                        let _ = reply.send(registry.statuses());
                    }
                    Some(RegistryCommand::Status(service, reply)) => {
                        let _ = reply.send(registry.status(&service));
                    }
                    Some(RegistryCommand::SetEnabled { service, enabled, reply }) => {
                        registry.set_enabled(&service, enabled);
                        let _ = reply.send(registry.status(&service));
                    }
                    Some(RegistryCommand::EnableUntil { service, expiration, reply }) => {
                        registry.enable_until(&service, expiration);
                        let _ = reply.send(registry.status(&service));
                    }
                    Some(RegistryCommand::Reload(reply)) => {
                        registry.load();
                        let _ = reply.send(registry.services());
                    }
                    Some(RegistryCommand::Shutdown) | None => {
                        tracing::info!("Reactor shutting down");
                        break;
                    }
                }
            }
            (index, stream, peer) = registry.next_connection() => {
                registry.dispatch(index, stream, peer);
            }
            _ = tokio::time::sleep_until(wakeup.unwrap_or_else(tokio::time::Instant::now)), if wakeup.is_some() => {
                registry.schedule_wakeup();
                registry.reap_handlers();
            }
            Some(()) = child_exited(&mut sigchld) => {
                registry.reap_handlers();
            }
            _ = cancel.cancelled() => {
                tracing::info!("Reactor shutting down");
                break;
            }
        }
    }
}
