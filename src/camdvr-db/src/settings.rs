//! Settings Store contract

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use camdvr_capture::ConnectionConfig;
use camdvr_processing::RecordingConfig;

/// Supplies and persists camera and recording settings.
///
/// One current record of each kind; saving replaces it.
pub trait SettingsStore: Send + Sync {
    fn get_connection_config(&self) -> Result<Option<ConnectionConfig>>;
    fn save_connection_config(&self, config: &ConnectionConfig) -> Result<()>;
    /// Saved recording settings, or the defaults when none were saved
    fn get_recording_config(&self) -> Result<RecordingConfig>;
    fn save_recording_config(&self, config: &RecordingConfig) -> Result<()>;

    /// Saved camera, or the first local device (unmirrored) when none was saved
    fn connection_config_or_default(&self) -> Result<ConnectionConfig> {
        Ok(self
            .get_connection_config()?
            .unwrap_or_else(|| ConnectionConfig::local(0)))
    }
}

/// Non-persistent store, handy for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySettings {
    connection: Mutex<Option<ConnectionConfig>>,
    recording: Mutex<RecordingConfig>,
    connection_saves: AtomicUsize,
}

impl MemorySettings {
    pub fn new(recording: RecordingConfig) -> Self {
        Self {
            recording: Mutex::new(recording),
            ..Self::default()
        }
    }

    /// Number of times a connection config was saved
    pub fn connection_saves(&self) -> usize {
        self.connection_saves.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn get_connection_config(&self) -> Result<Option<ConnectionConfig>> {
        Ok(self.connection.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save_connection_config(&self, config: &ConnectionConfig) -> Result<()> {
        *self.connection.lock().unwrap_or_else(|p| p.into_inner()) = Some(config.clone());
        self.connection_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_recording_config(&self) -> Result<RecordingConfig> {
        Ok(self.recording.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save_recording_config(&self, config: &RecordingConfig) -> Result<()> {
        *self.recording.lock().unwrap_or_else(|p| p.into_inner()) = config.clone();
        Ok(())
    }
}
