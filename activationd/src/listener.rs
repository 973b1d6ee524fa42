use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use shared::protocol::{enabled_key, expiration_key};
use shared::types::{ServiceDescriptor, ServiceStatus};
use crate::spawner::{connection_ref, HandlerProcess, ProcessSpawner};
use crate::store::ConfigStore;

/// One-way notifications about listener activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Emitted for every accepted connection, admitted or not
    ConnectionObserved { service: String, peer: SocketAddr },
    SpawnFailed {
        service: String,
        handler: String,
        argument: String,
        connection: String,
    },
    /// No port in the probe range could be bound
    ServiceUnavailable { service: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("no id set")]
    MissingId,
    #[error("no port set for service {0}")]
    MissingPort(String),
}

struct BoundSocket {
    port: u16,
    socket: TcpListener,
}

/// Owns the listening socket, admission policy and enable/expire state of
/// one service.
pub struct PortListener {
    service_id: String,
    base_port: u16,
    auto_port_range: u16,
    handler: String,
    argument: String,
    multi_instance: bool,
    bind_address: IpAddr,
    bound: Option<BoundSocket>,
    enabled: bool,
    expiration: Option<DateTime<Utc>>,
    handlers: Vec<Box<dyn HandlerProcess>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl PortListener {
    /// Build a listener from a descriptor and the overrides persisted in
    /// `store`, acquiring a port right away when the result is enabled.
    ///
    /// Must be called within a tokio runtime.
    pub fn load(
        descriptor: &ServiceDescriptor,
        store: &dyn ConfigStore,
        bind_address: IpAddr,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Result<Self, DescriptorError> {
        let service_id = descriptor.id.clone().ok_or(DescriptorError::MissingId)?;
        let base_port = descriptor
            .base_port
            .ok_or_else(|| DescriptorError::MissingPort(service_id.clone()))?;

        let persisted_enabled = store.read_bool(&enabled_key(&service_id)).unwrap_or_else(|e| {
            tracing::warn!("Ignoring persisted state of {}: {:#}", service_id, e);
            None
        });
        let expiration = store
            .read_timestamp(&expiration_key(&service_id))
            .unwrap_or_else(|e| {
                tracing::warn!("Ignoring persisted expiration of {}: {:#}", service_id, e);
                None
            });

        let mut enabled = persisted_enabled.unwrap_or(descriptor.enabled);
        if expiration.is_some_and(|t| t < Utc::now()) {
            enabled = false;
        }

        let mut listener = Self {
            service_id,
            base_port,
            auto_port_range: descriptor.auto_port_range,
            handler: descriptor.exec.clone(),
            argument: descriptor.argument.clone(),
            multi_instance: descriptor.multi_instance,
            bind_address,
            bound: None,
            enabled,
            expiration,
            handlers: Vec::new(),
            events,
        };

        if listener.enabled {
            listener.acquire();
        }

        Ok(listener)
    }

    /// Probe `base_port..base_port + auto_port_range` in order and listen on
    /// the first port that binds. At least `base_port` itself is tried.
    /// Returns false and disables the listener when no candidate binds.
    pub fn acquire(&mut self) -> bool {
        self.release();

        let attempts = self.auto_port_range.max(1);
        for offset in 0..attempts {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            match self.bind(port) {
                Ok(socket) => {
                    tracing::info!("Service {} listening on port {}", self.service_id, port);
                    self.bound = Some(BoundSocket { port, socket });
                    return true;
                }
                Err(e) => {
                    tracing::debug!("Service {} cannot bind port {}: {}", self.service_id, port, e);
                }
            }
        }

        tracing::debug!("Cannot load service {}: unable to get port", self.service_id);
        self.enabled = false;
        self.notify(ServiceEvent::ServiceUnavailable {
            service: self.service_id.clone(),
        });
        false
    }

    fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        let socket = std::net::TcpListener::bind((self.bind_address, port))?;
        socket.set_nonblocking(true)?;
        TcpListener::from_std(socket)
    }

    fn release(&mut self) {
        if let Some(bound) = self.bound.take() {
            tracing::info!("Service {} released port {}", self.service_id, bound.port);
        }
    }

    /// Poll this listener's socket for an inbound connection. Pending when
    /// nothing is bound.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<std::io::Result<(TcpStream, SocketAddr)>> {
        match &self.bound {
            Some(bound) => bound.socket.poll_accept(cx),
            None => Poll::Pending,
        }
    }

    /// Apply the admission policy to an accepted connection and hand it to
    /// a new handler process if admitted. The connection is closed here in
    /// every case; an admitted handler holds its own copy.
    pub fn accept(&mut self, connection: TcpStream, peer: SocketAddr, spawner: &dyn ProcessSpawner) {
        self.notify(ServiceEvent::ConnectionObserved {
            service: self.service_id.clone(),
            peer,
        });

        let busy = self.handler_running();
        if !self.is_enabled() || (!self.multi_instance && busy) {
            tracing::debug!("Service {} refused connection from {}", self.service_id, peer);
            return;
        }

        let connection = match connection.into_std().and_then(|c| {
            c.set_nonblocking(false)?;
            Ok(c)
        }) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Service {} lost connection from {}: {}", self.service_id, peer, e);
                return;
            }
        };

        match spawner.spawn(&self.handler, &self.argument, &connection) {
            Ok(process) => self.handlers.push(process),
            Err(e) => {
                tracing::warn!("Service {}: {}", self.service_id, e);
                self.notify(ServiceEvent::SpawnFailed {
                    service: self.service_id.clone(),
                    handler: self.handler.clone(),
                    argument: self.argument.clone(),
                    connection: connection_ref(&connection),
                });
            }
        }
    }

    /// Probe the spawned handlers, dropping the ones that exited.
    pub fn handler_running(&mut self) -> bool {
        self.handlers.retain_mut(|h| h.is_running());
        !self.handlers.is_empty()
    }

    /// Give up ownership of the spawned handlers so they can still be
    /// reaped after this listener is gone.
    pub fn take_handlers(&mut self) -> Vec<Box<dyn HandlerProcess>> {
        std::mem::take(&mut self.handlers)
    }

    /// Enable or disable the service and persist the new state.
    ///
    /// Enabling keeps an already bound port and otherwise probes from
    /// `base_port`; when no port can be acquired the listener stays disabled
    /// and nothing is persisted. Store failures are ignored.
    pub fn set_enabled(
        &mut self,
        store: &mut dyn ConfigStore,
        enabled: bool,
        expiration: Option<DateTime<Utc>>,
    ) {
        self.expiration = expiration;

        if enabled {
            if self.bound.is_none() && !self.acquire() {
                self.enabled = false;
                return;
            }
        } else {
            self.release();
        }

        self.enabled = enabled;

        let persisted = store
            .write_bool(&enabled_key(&self.service_id), self.enabled)
            .and_then(|_| store.write_timestamp(&expiration_key(&self.service_id), expiration))
            .and_then(|_| store.sync());
        if let Err(e) = persisted {
            tracing::debug!("Unpersisted state for {}: {:#}", self.service_id, e);
        }
    }

    pub fn name(&self) -> &str {
        &self.service_id
    }

    /// Whether the service accepts connections. An enable grant whose
    /// expiration has passed reads as disabled before any sweep flips it.
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.is_expired(Utc::now())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|t| t <= now)
    }

    pub fn port(&self) -> Option<u16> {
        self.bound.as_ref().map(|b| b.port)
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            id: self.service_id.clone(),
            installed: true,
            enabled: self.is_enabled(),
            port: self.port(),
            expiration: self.expiration,
        }
    }

    fn notify(&self, event: ServiceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
