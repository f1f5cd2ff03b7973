//! camdvr-db - Settings persistence for camdvr
//!
//! SQLite-backed Settings Store holding the current camera connection and
//! recording settings.

mod error;
mod migrations;
mod queries;
mod settings;

pub use error::DatabaseError;
pub use queries::*;
pub use settings::{MemorySettings, SettingsStore};

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use camdvr_capture::ConnectionConfig;
use camdvr_processing::RecordingConfig;

/// Database connection wrapper with initialization.
///
/// The connection sits behind a mutex so the capture thread can persist the
/// active camera while the control thread reads or updates settings.
pub struct Database {
    conn: Mutex<Connection>,
    recording_defaults: RecordingConfig,
}

impl Database {
    /// Open or create database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening database at {:?}", path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode so `camdvr recording` can edit while `run` is active
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory database");
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            recording_defaults: RecordingConfig::default(),
        })
    }

    /// Recording settings reported while no row has been saved yet
    pub fn with_recording_defaults(mut self, defaults: RecordingConfig) -> Self {
        self.recording_defaults = defaults;
        self
    }

    /// Lock the underlying connection
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite inconsistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i64> {
        Ok(migrations::get_schema_version(&self.connection())?)
    }
}

impl SettingsStore for Database {
    fn get_connection_config(&self) -> Result<Option<ConnectionConfig>> {
        queries::get_connection_config(&self.connection())
    }

    fn save_connection_config(&self, config: &ConnectionConfig) -> Result<()> {
        queries::save_connection_config(&self.connection(), config)?;
        debug!("saved camera settings: {}", config);
        Ok(())
    }

    fn get_recording_config(&self) -> Result<RecordingConfig> {
        Ok(queries::get_recording_config(&self.connection())?
            .unwrap_or_else(|| self.recording_defaults.clone()))
    }

    fn save_recording_config(&self, config: &RecordingConfig) -> Result<()> {
        queries::save_recording_config(&self.connection(), config)?;
        debug!("saved recording settings for {:?}", config.destination);
        Ok(())
    }
}
