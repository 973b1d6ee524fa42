use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static description of one activatable network service.
///
/// `id` and `base_port` are optional because descriptors come from loosely
/// validated files; a descriptor missing either is invalid and never gets a
/// listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Stable service identity, e.g. "krfb"
    pub id: Option<String>,

    /// First port tried when acquiring a listening socket
    pub base_port: Option<u16>,

    /// Number of consecutive ports to probe starting at `base_port`
    #[serde(default)]
    pub auto_port_range: u16,

    /// Enabled state used when no persisted override exists
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Handler program started for each admitted connection
    #[serde(default)]
    pub exec: String,

    /// Argument passed to the handler ahead of the connection descriptor
    #[serde(default)]
    pub argument: String,

    /// Whether several handlers may run at the same time
    #[serde(default)]
    pub multi_instance: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServiceDescriptor {
    pub fn is_valid(&self) -> bool {
        self.id.is_some() && self.base_port.is_some()
    }
}

/// Runtime state of a registered service, as reported by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,

    /// False when no listener is registered under `id`
    pub installed: bool,

    pub enabled: bool,

    /// Port currently listened on, if any
    pub port: Option<u16>,

    /// Time after which the service disables itself; `None` means indefinitely
    pub expiration: Option<DateTime<Utc>>,
}

impl ServiceStatus {
    /// Status reported for an id that has no listener
    pub fn not_installed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            installed: false,
            enabled: false,
            port: None,
            expiration: None,
        }
    }
}

/// Body of an enable/disable request. An `expiration` implies enabling until
/// that time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}
