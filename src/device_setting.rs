//! Per-device bootstrap scripts
//!
//! A script is line oriented, each line reading `OP URI [ARG...]`. Operation
//! names are case-insensitive and only `delete` and `write` are kept; lines may
//! end in `\n` or `\r\n`.
//!
//! Two backends serve scripts by endpoint name: one file per device, or a
//! SQLite table.

use crate::config::DeviceSettingConfig;
use crate::error::{Lwm2mError, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Bootstrap step operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    Delete,
    Write,
}

/// One step of a bootstrap script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    pub op: ScriptOp,
    pub uri: String,
    /// Remaining tokens joined with single spaces, empty when absent
    pub arg: String,
}

/// Parse a bootstrap script, skipping lines with unknown operations
pub fn parse_script(text: &str) -> Vec<ScriptStep> {
    let separator = if text.contains("\r\n") { "\r\n" } else { "\n" };

    text.split(separator)
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split(' ').collect();
            let op = match tokens.first()?.to_lowercase().as_str() {
                "delete" => ScriptOp::Delete,
                "write" => ScriptOp::Write,
                _ => return None,
            };
            let uri = tokens.get(1)?;
            Some(ScriptStep {
                op,
                uri: uri.to_string(),
                arg: tokens[2..].join(" "),
            })
        })
        .collect()
}

/// Source of bootstrap scripts
#[async_trait]
pub trait DeviceSettingStore: Send + Sync {
    /// Script of the device registered under `endpoint`, `DeviceNotFound` when none exists
    async fn get(&self, endpoint: &str) -> Result<Vec<ScriptStep>>;
}

/// Scripts stored as `<root>/<endpoint>.setting`
#[derive(Debug, Clone)]
pub struct FileDeviceSetting {
    root: PathBuf,
}

impl FileDeviceSetting {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Script file of `endpoint`, `None` for names that would leave the root directory
    pub fn script_path(&self, endpoint: &str) -> Option<PathBuf> {
        if endpoint.is_empty()
            || endpoint.contains(['/', '\\'])
            || endpoint.contains("..")
        {
            return None;
        }
        Some(self.root.join(format!("{}.setting", endpoint)))
    }
}

#[async_trait]
impl DeviceSettingStore for FileDeviceSetting {
    async fn get(&self, endpoint: &str) -> Result<Vec<ScriptStep>> {
        let Some(path) = self.script_path(endpoint) else {
            tracing::warn!(endpoint, "Refusing bootstrap script lookup outside the settings root");
            return Err(Lwm2mError::DeviceNotFound(endpoint.to_string()));
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(parse_script(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Lwm2mError::DeviceNotFound(endpoint.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Scripts stored in a SQLite database
///
/// # Schema
///
/// ```sql
/// CREATE TABLE bootstraps (
///     name TEXT PRIMARY KEY,
///     setting TEXT NOT NULL
/// );
/// ```
pub struct SqliteDeviceSetting {
    conn: Mutex<Connection>,
}

impl SqliteDeviceSetting {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory database, empty until scripts are added with [`Self::put`]
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bootstraps (
                name TEXT PRIMARY KEY,
                setting TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store or replace the script of `endpoint`
    pub fn put(&self, endpoint: &str, script: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT OR REPLACE INTO bootstraps (name, setting) VALUES (?1, ?2)",
            params![endpoint, script],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DeviceSettingStore for SqliteDeviceSetting {
    async fn get(&self, endpoint: &str) -> Result<Vec<ScriptStep>> {
        let setting: Option<String> = {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row(
                "SELECT setting FROM bootstraps WHERE name = ?1",
                params![endpoint],
                |row| row.get(0),
            )
            .optional()?
        };

        setting
            .map(|text| parse_script(&text))
            .ok_or_else(|| Lwm2mError::DeviceNotFound(endpoint.to_string()))
    }
}

/// Build the backend selected in the configuration
pub fn from_config(config: &DeviceSettingConfig) -> Result<Arc<dyn DeviceSettingStore>> {
    match config {
        DeviceSettingConfig::File { root_path } => {
            Ok(Arc::new(FileDeviceSetting::new(root_path.clone())))
        }
        DeviceSettingConfig::Sqlite { path } => Ok(Arc::new(SqliteDeviceSetting::open(path)?)),
    }
}
