use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::types::ServiceDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Descriptors declared inline, registered ahead of `daemon.services_dir`
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Directory of `*.toml` service descriptor files
    #[serde(default)]
    pub services_dir: Option<PathBuf>,
    /// Slack added to the wakeup timer after the next expiration
    #[serde(default = "default_expiration_margin")]
    pub expiration_margin_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_expiration_margin() -> u64 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/activationd/settings.db")
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            services_dir: None,
            expiration_margin_secs: default_expiration_margin(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.daemon.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.daemon.expiration_margin_secs, 30);
        assert!(config.daemon.services_dir.is_none());
        assert_eq!(config.api.listen, "127.0.0.1:8054");
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_inline_services() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            bind_address = "127.0.0.1"
            expiration_margin_secs = 5

            [[services]]
            id = "krfb"
            base_port = 5900
            auto_port_range = 10
            exec = "/usr/bin/krfb"
            argument = "--inetd"

            [[services]]
            base_port = 6000
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.expiration_margin_secs, 5);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].id.as_deref(), Some("krfb"));
        assert_eq!(config.services[0].auto_port_range, 10);
        assert!(!config.services[1].is_valid());
    }
}
