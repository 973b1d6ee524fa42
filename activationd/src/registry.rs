use std::future::poll_fn;
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use shared::types::ServiceStatus;
use crate::descriptor::DescriptorProvider;
use crate::listener::{PortListener, ServiceEvent};
use crate::spawner::{HandlerProcess, ProcessSpawner};
use crate::store::ConfigStore;

pub struct RegistryOptions {
    pub bind_address: IpAddr,
    /// Slack added after the next expiration before the wakeup fires
    pub expiration_margin: Duration,
}

/// Owns every port listener plus the single wakeup timer that retires
/// expired enable grants.
pub struct ServiceRegistry {
    listeners: Vec<PortListener>,
    provider: Box<dyn DescriptorProvider>,
    store: Box<dyn ConfigStore>,
    spawner: Box<dyn ProcessSpawner>,
    events: broadcast::Sender<ServiceEvent>,
    options: RegistryOptions,
    wakeup: Option<Instant>,
    /// Handlers whose listener was replaced by a reload, kept until reaped
    detached: Vec<Box<dyn HandlerProcess>>,
    /// Listener index the next accept poll starts from
    poll_start: usize,
}

impl ServiceRegistry {
    /// Create an empty registry. Call [`ServiceRegistry::load`] to register
    /// the provider's services. Listener notifications go to `events`.
    pub fn new(
        provider: Box<dyn DescriptorProvider>,
        store: Box<dyn ConfigStore>,
        spawner: Box<dyn ProcessSpawner>,
        options: RegistryOptions,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        Self {
            listeners: Vec::new(),
            provider,
            store,
            spawner,
            events,
            options,
            wakeup: None,
            detached: Vec::new(),
            poll_start: 0,
        }
    }

    /// Replace all listeners with fresh ones built from the provider's
    /// current descriptors, then reschedule the wakeup timer. Old listeners
    /// release their ports before any new one binds.
    pub fn load(&mut self) {
        for mut listener in self.listeners.drain(..) {
            self.detached.extend(listener.take_handlers());
        }
        self.detached.retain_mut(|h| h.is_running());

        for descriptor in self.provider.list_service_descriptors() {
            match PortListener::load(
                &descriptor,
                self.store.as_ref(),
                self.options.bind_address,
                self.events.clone(),
            ) {
                Ok(listener) => self.listeners.push(listener),
                Err(e) => tracing::warn!("Cannot load service: {}", e),
            }
        }

        tracing::info!("Loaded {} services", self.listeners.len());
        self.schedule_wakeup();
    }

    /// Earliest expiration still in the future among all listeners.
    ///
    /// Also disables every listener whose expiration has already passed,
    /// before computing the result.
    pub fn next_expiration(&mut self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let mut next: Option<DateTime<Utc>> = None;

        for listener in &mut self.listeners {
            let Some(expiration) = listener.expiration() else {
                continue;
            };
            if expiration <= now {
                tracing::info!("Enable grant of {} expired at {}", listener.name(), expiration);
                listener.set_enabled(self.store.as_mut(), false, None);
            } else if next.map_or(true, |n| expiration < n) {
                next = Some(expiration);
            }
        }

        next
    }

    /// Arm the wakeup timer for the next expiration plus the safety margin,
    /// replacing any armed timer, or disarm it when nothing expires.
    pub fn schedule_wakeup(&mut self) {
        self.wakeup = self.next_expiration().map(|expiration| {
            let until = (expiration - Utc::now()).to_std().unwrap_or_default();
            Instant::now() + until + self.options.expiration_margin
        });

        match self.wakeup {
            Some(deadline) => tracing::debug!(
                "Next expiration wakeup in {:?}",
                deadline.saturating_duration_since(Instant::now())
            ),
            None => tracing::debug!("No pending expirations"),
        }
    }

    /// Deadline of the armed wakeup timer, if any
    pub fn wakeup(&self) -> Option<Instant> {
        self.wakeup
    }

    /// Wait for an inbound connection on any bound listener. Returns the
    /// listener's index together with the accepted connection.
    ///
    /// Polling resumes after the listener that produced the previous
    /// connection so a busy backlog cannot starve the others. Accept errors
    /// are logged and the listener is polled again on the next wake.
    pub async fn next_connection(&mut self) -> (usize, TcpStream, SocketAddr) {
        poll_fn(|cx| {
            let count = self.listeners.len();
            for step in 0..count {
                let index = (self.poll_start + step) % count;
                let listener = &self.listeners[index];
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok((stream, peer))) => {
                        self.poll_start = (index + 1) % count;
                        return Poll::Ready((index, stream, peer));
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!("Accept failed on {}: {}", listener.name(), e);
                        // A failed accept registers no interest
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Probe every handler process and reap the ones that exited, including
    /// those detached from listeners by a reload.
    pub fn reap_handlers(&mut self) {
        self.detached.retain_mut(|h| h.is_running());
        for listener in &mut self.listeners {
            listener.handler_running();
        }
    }

    /// Run the admission policy of listener `index` on an accepted connection
    pub fn dispatch(&mut self, index: usize, stream: TcpStream, peer: SocketAddr) {
        if let Some(listener) = self.listeners.get_mut(index) {
            listener.accept(stream, peer, self.spawner.as_ref());
        }
    }

    fn listener(&self, service: &str) -> Option<&PortListener> {
        self.listeners.iter().find(|l| l.name() == service)
    }

    /// Enable or disable a service indefinitely
    pub fn set_enabled(&mut self, service: &str, enabled: bool) {
        self.update(service, enabled, None);
    }

    /// Enable a service until `expiration`
    pub fn enable_until(&mut self, service: &str, expiration: DateTime<Utc>) {
        self.update(service, true, Some(expiration));
    }

    fn update(&mut self, service: &str, enabled: bool, expiration: Option<DateTime<Utc>>) {
        let Some(listener) = self.listeners.iter_mut().find(|l| l.name() == service) else {
            tracing::info!("Ignoring request for unknown service {}", service);
            return;
        };
        listener.set_enabled(self.store.as_mut(), enabled, expiration);
        self.schedule_wakeup();
    }

    /// Registered service ids in registration order
    pub fn services(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name().to_string()).collect()
    }

    pub fn is_enabled(&self, service: &str) -> bool {
        self.listener(service).is_some_and(|l| l.is_enabled())
    }

    pub fn port(&self, service: &str) -> Option<u16> {
        self.listener(service).and_then(|l| l.port())
    }

    pub fn is_installed(&self, service: &str) -> bool {
        self.listener(service).is_some()
    }

    /// Unknown ids report as not installed
    pub fn status(&self, service: &str) -> ServiceStatus {
        ServiceStatus {
            id: service.to_string(),
            installed: self.is_installed(service),
            enabled: self.is_enabled(service),
            port: self.port(service),
            expiration: self.listener(service).and_then(|l| l.expiration()),
        }
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.listeners.iter().map(|l| l.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use chrono::Duration as ChronoDuration;
    use shared::types::ServiceDescriptor;
    use crate::spawner::CommandSpawner;
    use crate::store::db::SqliteStore;
    use crate::testutil::{descriptor, occupy_ports, FakeSpawner, LOCALHOST};

    fn registry(descriptors: Vec<ServiceDescriptor>, spawner: impl ProcessSpawner + 'static) -> ServiceRegistry {
        registry_with_margin(descriptors, spawner, Duration::from_secs(30))
    }

    fn registry_with_margin(
        descriptors: Vec<ServiceDescriptor>,
        spawner: impl ProcessSpawner + 'static,
        expiration_margin: Duration,
    ) -> ServiceRegistry {
        let store = SqliteStore::open(":memory:").unwrap();
        let mut registry = ServiceRegistry::new(
            Box::new(descriptors),
            Box::new(store),
            Box::new(spawner),
            RegistryOptions {
                bind_address: LOCALHOST,
                expiration_margin,
            },
            broadcast::channel(16).0,
        );
        registry.load();
        registry
    }

    /// Descriptor whose handler appends its pid to `pids` and exits
    fn recording_descriptor(dir: &std::path::Path, base: u16, pids: &std::path::Path) -> ServiceDescriptor {
        let script = dir.join("handler.sh");
        std::fs::write(&script, format!("echo $$ >> {}\n", pids.display())).unwrap();
        let mut desc = descriptor("foo", base, 1);
        desc.exec = "/bin/sh".to_string();
        desc.argument = script.to_str().unwrap().to_string();
        desc.multi_instance = true;
        desc
    }

    async fn wait_for_pids(pids: &std::path::Path, count: usize) -> Vec<u32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let recorded: Vec<u32> = std::fs::read_to_string(pids)
                .unwrap_or_default()
                .lines()
                .filter_map(|l| l.trim().parse().ok())
                .collect();
            if recorded.len() >= count {
                return recorded;
            }
            assert!(Instant::now() < deadline, "handlers never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// A reaped child has no process table entry left, not even a zombie
    fn reaped(pid: u32) -> bool {
        !std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    /// Ports that were free a moment ago, one per service
    fn free_ports(count: u16) -> u16 {
        let (base, held) = occupy_ports(count);
        drop(held);
        base
    }

    #[tokio::test]
    async fn test_load_skips_invalid_descriptors() {
        let base = free_ports(2);
        let mut invalid = descriptor("broken", base, 1);
        invalid.base_port = None;

        let registry = registry(
            vec![descriptor("foo", base, 1), invalid, descriptor("bar", base + 1, 1)],
            FakeSpawner::default(),
        );

        assert_eq!(registry.services(), vec!["foo", "bar"]);
        assert!(!registry.is_installed("broken"));
    }

    #[tokio::test]
    async fn test_probe_binds_first_free_port() {
        let (base, mut held) = occupy_ports(3);
        held.truncate(2);

        let registry = registry(vec![descriptor("foo", base, 3)], FakeSpawner::default());

        assert!(registry.is_enabled("foo"));
        assert_eq!(registry.port("foo"), Some(base + 2));
    }

    #[tokio::test]
    async fn test_exhausted_range_leaves_service_installed_but_inert() {
        let (base, _held) = occupy_ports(3);

        let registry = registry(vec![descriptor("foo", base, 3)], FakeSpawner::default());

        assert!(registry.is_installed("foo"));
        assert!(!registry.is_enabled("foo"));
        assert_eq!(registry.port("foo"), None);
    }

    #[tokio::test]
    async fn test_unknown_service_defaults() {
        let mut registry = registry(Vec::new(), FakeSpawner::default());

        assert!(!registry.is_enabled("nope"));
        assert_eq!(registry.port("nope"), None);
        assert!(!registry.is_installed("nope"));
        assert_eq!(registry.status("nope"), ServiceStatus::not_installed("nope"));

        registry.set_enabled("nope", true);
        registry.enable_until("nope", Utc::now() + ChronoDuration::seconds(10));
        assert!(registry.services().is_empty());
        assert!(registry.wakeup().is_none());
    }

    #[tokio::test]
    async fn test_next_expiration_returns_minimum_and_sweeps_expired() {
        let base = free_ports(3);
        let mut registry = registry(
            vec![
                descriptor("expired", base, 1),
                descriptor("soon", base + 1, 1),
                descriptor("later", base + 2, 1),
            ],
            FakeSpawner::default(),
        );

        let soon = Utc::now() + ChronoDuration::seconds(60);
        registry.enable_until("soon", soon);
        registry.enable_until("later", soon + ChronoDuration::seconds(60));

        // Bypass the administrative path so the grant is already stale
        let past = Utc::now() - ChronoDuration::seconds(1);
        let store = registry.store.as_mut();
        registry.listeners[0].set_enabled(store, true, Some(past));
        assert_eq!(registry.port("expired"), Some(base));

        let next = registry.next_expiration();

        assert_eq!(next, Some(soon));
        assert!(!registry.is_enabled("expired"));
        assert_eq!(registry.port("expired"), None);
        assert_eq!(registry.status("expired").expiration, None);
        assert!(StdTcpStream::connect((LOCALHOST, base)).is_err());
        assert!(registry.is_enabled("soon"));
        assert!(registry.is_enabled("later"));
    }

    #[tokio::test]
    async fn test_next_expiration_none_without_grants() {
        let base = free_ports(1);
        let mut registry = registry(vec![descriptor("foo", base, 1)], FakeSpawner::default());

        assert_eq!(registry.next_expiration(), None);
        assert!(registry.wakeup().is_none());
        assert!(registry.is_enabled("foo"));
    }

    #[tokio::test]
    async fn test_enable_until_arms_single_wakeup_with_margin() {
        let base = free_ports(2);
        let mut registry = registry(
            vec![descriptor("foo", base, 1), descriptor("bar", base + 1, 1)],
            FakeSpawner::default(),
        );

        let before = Instant::now();
        registry.enable_until("foo", Utc::now() + ChronoDuration::seconds(100));
        registry.enable_until("bar", Utc::now() + ChronoDuration::seconds(10));

        let wakeup = registry.wakeup().unwrap();
        let delay = wakeup.duration_since(before);
        assert!(delay >= Duration::from_secs(39), "delay {:?}", delay);
        assert!(delay <= Duration::from_secs(41), "delay {:?}", delay);

        // Clearing the soonest grant moves the timer to the other one
        registry.set_enabled("bar", true);
        let delay = registry.wakeup().unwrap().duration_since(before);
        assert!(delay >= Duration::from_secs(129), "delay {:?}", delay);

        registry.set_enabled("foo", false);
        assert!(registry.wakeup().is_none());
    }

    #[tokio::test]
    async fn test_enable_until_past_time_is_swept_immediately() {
        let base = free_ports(1);
        let mut registry = registry(vec![descriptor("foo", base, 1)], FakeSpawner::default());

        registry.enable_until("foo", Utc::now() - ChronoDuration::seconds(5));

        assert!(!registry.is_enabled("foo"));
        assert_eq!(registry.port("foo"), None);
        assert!(registry.wakeup().is_none());
    }

    #[tokio::test]
    async fn test_reload_releases_ports_before_rebinding() {
        let base = free_ports(1);
        let mut registry = registry(vec![descriptor("foo", base, 1)], FakeSpawner::default());
        assert_eq!(registry.port("foo"), Some(base));

        registry.load();

        assert_eq!(registry.port("foo"), Some(base));
    }

    #[tokio::test]
    async fn test_reload_restores_persisted_state() {
        let base = free_ports(1);
        let mut registry = registry(vec![descriptor("foo", base, 1)], FakeSpawner::default());

        registry.set_enabled("foo", false);
        registry.load();

        assert!(registry.is_installed("foo"));
        assert!(!registry.is_enabled("foo"));
    }

    #[tokio::test]
    async fn test_duplicate_ids_first_registration_wins_lookups() {
        let base = free_ports(2);
        let registry = registry(
            vec![descriptor("foo", base, 1), descriptor("foo", base + 1, 1)],
            FakeSpawner::default(),
        );

        assert_eq!(registry.services(), vec!["foo", "foo"]);
        assert_eq!(registry.port("foo"), Some(base));
    }

    #[tokio::test]
    async fn test_dispatch_routes_connection_to_listener() {
        let base = free_ports(2);
        let spawner = FakeSpawner::default();
        let mut registry = registry(
            vec![descriptor("foo", base, 1), descriptor("bar", base + 1, 1)],
            spawner.clone(),
        );
        let mut events = registry.events.subscribe();

        let _client = StdTcpStream::connect((LOCALHOST, base + 1)).unwrap();
        let (index, stream, peer) = registry.next_connection().await;
        assert_eq!(index, 1);
        registry.dispatch(index, stream, peer);

        assert_eq!(spawner.calls().len(), 1);
        assert!(registry.listeners[1].handler_running());
        assert!(!registry.listeners[0].handler_running());
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::ConnectionObserved { service: "bar".to_string(), peer }
        );
    }

    #[tokio::test]
    async fn test_timer_expiry_disables_service_and_refuses_connections() {
        let base = free_ports(1);
        let mut registry = registry_with_margin(
            vec![descriptor("foo", base, 1)],
            FakeSpawner::default(),
            Duration::from_millis(100),
        );

        registry.enable_until("foo", Utc::now() + ChronoDuration::seconds(1));
        assert_eq!(registry.port("foo"), Some(base));

        let deadline = registry.wakeup().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(1200));
        tokio::time::sleep_until(deadline).await;
        registry.schedule_wakeup();

        assert!(!registry.is_enabled("foo"));
        assert_eq!(registry.port("foo"), None);
        assert!(registry.wakeup().is_none());
        assert!(StdTcpStream::connect((LOCALHOST, base)).is_err());
    }

    #[tokio::test]
    async fn test_next_connection_rotates_between_listeners() {
        let base = free_ports(2);
        let mut registry = registry(
            vec![descriptor("foo", base, 1), descriptor("bar", base + 1, 1)],
            FakeSpawner::default(),
        );

        let _first = StdTcpStream::connect((LOCALHOST, base)).unwrap();
        let _second = StdTcpStream::connect((LOCALHOST, base)).unwrap();
        let _third = StdTcpStream::connect((LOCALHOST, base + 1)).unwrap();

        let (index, _, _) = registry.next_connection().await;
        assert_eq!(index, 0);
        // foo still has a queued connection, bar gets its turn first
        let (index, _, _) = registry.next_connection().await;
        assert_eq!(index, 1);
        let (index, _, _) = registry.next_connection().await;
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_reload_reaps_exited_handlers() {
        let dir = tempfile::TempDir::new().unwrap();
        let pids = dir.path().join("pids");
        let base = free_ports(1);
        let mut registry = registry(vec![recording_descriptor(dir.path(), base, &pids)], CommandSpawner);

        for _ in 0..3 {
            let _client = StdTcpStream::connect((LOCALHOST, base)).unwrap();
            let (index, stream, peer) = registry.next_connection().await;
            registry.dispatch(index, stream, peer);
        }
        let recorded = wait_for_pids(&pids, 3).await;

        // Reload drops the old listener; nothing else reaps in this test
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorded.iter().all(|&pid| reaped(pid)) {
            assert!(Instant::now() < deadline, "handlers left as zombies");
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.load();
        }
        assert!(registry.detached.is_empty());
    }

    #[tokio::test]
    async fn test_reap_handlers_collects_idle_multi_instance_handlers() {
        let dir = tempfile::TempDir::new().unwrap();
        let pids = dir.path().join("pids");
        let base = free_ports(1);
        let mut registry = registry(vec![recording_descriptor(dir.path(), base, &pids)], CommandSpawner);

        let _client = StdTcpStream::connect((LOCALHOST, base)).unwrap();
        let (index, stream, peer) = registry.next_connection().await;
        registry.dispatch(index, stream, peer);
        let recorded = wait_for_pids(&pids, 1).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !reaped(recorded[0]) {
            assert!(Instant::now() < deadline, "handler left as zombie");
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.reap_handlers();
        }
        assert!(!registry.listeners[0].handler_running());
    }
}
