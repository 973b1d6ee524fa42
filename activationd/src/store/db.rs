use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use super::ConfigStore;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the settings database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read setting {}", key))
    }

    fn write(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )
        .with_context(|| format!("Failed to write setting {}", key))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove setting {}", key))?;
        Ok(())
    }
}

impl ConfigStore for SqliteStore {
    fn read_bool(&self, key: &str) -> Result<Option<bool>> {
        self.read(key)?
            .map(|value| {
                value
                    .parse::<bool>()
                    .with_context(|| format!("Setting {} is not a bool: {:?}", key, value))
            })
            .transpose()
    }

    fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.read(key)?
            .map(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("Setting {} is not a timestamp: {:?}", key, value))
            })
            .transpose()
    }

    fn write_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.write(key, if value { "true" } else { "false" })
    }

    fn write_timestamp(&mut self, key: &str, value: Option<DateTime<Utc>>) -> Result<()> {
        match value {
            Some(t) => self.write(key, &t.to_rfc3339()),
            None => self.remove(key),
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .context("Failed to checkpoint settings database")
    }
}
