pub mod db;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Key/value storage for persisted per-service overrides.
pub trait ConfigStore: Send {
    fn read_bool(&self, key: &str) -> Result<Option<bool>>;
    fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    fn write_bool(&mut self, key: &str, value: bool) -> Result<()>;
    /// Writing `None` removes the key.
    fn write_timestamp(&mut self, key: &str, value: Option<DateTime<Utc>>) -> Result<()>;
    /// Flush pending writes to durable storage
    fn sync(&mut self) -> Result<()>;
}
