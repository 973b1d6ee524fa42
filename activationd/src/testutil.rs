use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use shared::types::ServiceDescriptor;
use crate::spawner::{HandlerProcess, ProcessSpawner, SpawnError};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn descriptor(id: &str, base_port: u16, auto_port_range: u16) -> ServiceDescriptor {
    ServiceDescriptor {
        id: Some(id.to_string()),
        base_port: Some(base_port),
        auto_port_range,
        enabled: true,
        exec: "/usr/bin/handler".to_string(),
        argument: "--inetd".to_string(),
        multi_instance: false,
    }
}

/// Find `len` consecutive free loopback ports and hold them all. Returns the
/// first port and the listeners, in port order; drop a listener to free its
/// port.
pub fn occupy_ports(len: u16) -> (u16, Vec<TcpListener>) {
    loop {
        let first = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let base = first.local_addr().unwrap().port();
        if base.checked_add(len).is_none() {
            continue;
        }

        let mut held = vec![first];
        for offset in 1..len {
            match TcpListener::bind((LOCALHOST, base + offset)) {
                Ok(l) => held.push(l),
                Err(_) => break,
            }
        }
        if held.len() == len as usize {
            return (base, held);
        }
    }
}

/// Records spawn calls instead of starting processes. Every handler it hands
/// out reports the shared running flag.
#[derive(Clone)]
pub struct FakeSpawner {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    running: Arc<AtomicBool>,
    fail: bool,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self {
            calls: Arc::default(),
            running: Arc::new(AtomicBool::new(true)),
            fail: false,
        }
    }
}

impl FakeSpawner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

struct FakeProcess(Arc<AtomicBool>);

impl HandlerProcess for FakeProcess {
    fn is_running(&mut self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        handler: &str,
        argument: &str,
        connection: &TcpStream,
    ) -> Result<Box<dyn HandlerProcess>, SpawnError> {
        if self.fail {
            return Err(SpawnError::Start {
                handler: handler.to_string(),
                argument: argument.to_string(),
                connection: crate::spawner::connection_ref(connection),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such handler"),
            });
        }
        self.calls
            .lock()
            .unwrap()
            .push((handler.to_string(), argument.to_string()));
        Ok(Box::new(FakeProcess(self.running.clone())))
    }
}
