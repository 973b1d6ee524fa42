use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start \"{handler} {argument} {connection}\": {source}")]
    Start {
        handler: String,
        argument: String,
        connection: String,
        #[source]
        source: std::io::Error,
    },
}

/// A started handler process. `is_running` is a best-effort liveness probe.
pub trait HandlerProcess: Send {
    fn is_running(&mut self) -> bool;
}

/// Starts one handler process per admitted connection.
pub trait ProcessSpawner: Send {
    fn spawn(
        &self,
        handler: &str,
        argument: &str,
        connection: &TcpStream,
    ) -> Result<Box<dyn HandlerProcess>, SpawnError>;
}

/// Reference to a connection as handed to handlers: its descriptor number.
pub fn connection_ref(connection: &TcpStream) -> String {
    connection.as_raw_fd().to_string()
}

/// Runs `handler [argument] <fd>` in its own session. The connection's
/// descriptor is inherited by the child under the same number.
#[derive(Debug, Default, Clone)]
pub struct CommandSpawner;

struct ChildHandler(Child);

impl HandlerProcess for ChildHandler {
    fn is_running(&mut self) -> bool {
        // try_wait also reaps the child once it exits
        matches!(self.0.try_wait(), Ok(None))
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(
        &self,
        handler: &str,
        argument: &str,
        connection: &TcpStream,
    ) -> Result<Box<dyn HandlerProcess>, SpawnError> {
        let fd = connection.as_raw_fd();

        let mut cmd = Command::new(handler);
        if !argument.is_empty() {
            cmd.arg(argument);
        }
        cmd.arg(fd.to_string()).stdin(Stdio::null());

        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SpawnError::Start {
            handler: handler.to_string(),
            argument: argument.to_string(),
            connection: fd.to_string(),
            source,
        })?;

        tracing::debug!("Started {} (pid {}) for connection {}", handler, child.id(), fd);
        Ok(Box::new(ChildHandler(child)))
    }
}
