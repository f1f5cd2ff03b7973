//! Application configuration
//!
//! TOML file with per-section defaults. Camera and recording settings are not
//! here; they live in the settings store so the `camera` and `recording`
//! commands can change them while `run` is active.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use camdvr_capture::FfmpegOpener;
use camdvr_processing::{FfmpegEncoder, RecorderSettings};

use crate::supervisor::ReconnectPolicy;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub source: SourceConfig,
}

/// Data locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Data directory (defaults to the platform local data dir + camdvr)
    pub data_dir: Option<PathBuf>,

    /// Settings database (defaults to `<data_dir>/camdvr.db`)
    pub database: Option<PathBuf>,
}

/// Backoff between reopen attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: f64,

    /// Growth factor per failed attempt; 1.0 keeps the delay constant
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,

    /// Give up after this many failed attempts (unset = retry forever)
    pub max_attempts: Option<u32>,
}

/// Segment recorder tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_max_write_failures")]
    pub max_write_failures: u32,

    #[serde(default = "default_write_retry_secs")]
    pub write_retry_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// qscale for mpeg4/mjpeg output (2-31, lower = better)
    #[serde(default = "default_quality")]
    pub quality: u32,
}

/// FFmpeg input settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub rtsp_over_tcp: bool,
}

fn default_backoff_secs() -> f64 { 5.0 }
fn default_multiplier() -> f64 { 1.0 }
fn default_max_backoff_secs() -> f64 { 60.0 }
fn default_max_write_failures() -> u32 { 3 }
fn default_write_retry_secs() -> u64 { 10 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_quality() -> u32 { 5 }
fn default_network_timeout_secs() -> u64 { 5 }
fn default_true() -> bool { true }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff_secs(),
            multiplier: default_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
            max_attempts: None,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_write_failures: default_max_write_failures(),
            write_retry_secs: default_write_retry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            quality: default_quality(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            rtsp_over_tcp: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&content).context("failed to parse config TOML")
    }

    /// Load `path` if given, otherwise `<config dir>/camdvr/config.toml` when
    /// it exists, otherwise defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match dirs::config_dir().map(|d| d.join("camdvr").join("config.toml")) {
            Some(default_path) if default_path.exists() => Self::from_file(default_path),
            _ => Ok(Self::default()),
        }
    }

    /// Resolve data directory with fallback to default
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.general.data_dir {
            dir.clone()
        } else {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("camdvr")
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.general
            .database
            .clone()
            .unwrap_or_else(|| self.resolve_data_dir().join("camdvr.db"))
    }

    /// Destination used until recording settings are saved
    pub fn default_recordings_dir(&self) -> PathBuf {
        self.resolve_data_dir().join("recordings")
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let r = &self.reconnect;
        ReconnectPolicy {
            backoff: backoff_duration(r.backoff_secs),
            multiplier: if r.multiplier.is_finite() { r.multiplier.max(1.0) } else { 1.0 },
            max_backoff: backoff_duration(r.max_backoff_secs),
            max_attempts: r.max_attempts,
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            max_write_failures: self.recorder.max_write_failures.max(1),
            write_retry_interval: Duration::from_secs(self.recorder.write_retry_secs),
            sweep_interval: Duration::from_secs(self.recorder.sweep_interval_secs),
        }
    }

    pub fn encoder(&self) -> FfmpegEncoder {
        FfmpegEncoder {
            quality: self.recorder.quality.clamp(2, 31),
            ..FfmpegEncoder::default()
        }
    }

    pub fn opener(&self) -> FfmpegOpener {
        FfmpegOpener {
            network_timeout: Duration::from_secs(self.source.network_timeout_secs),
            rtsp_over_tcp: self.source.rtsp_over_tcp,
            ..FfmpegOpener::default()
        }
    }
}

/// Floor for reconnect delays; a zero backoff would spin on a dead camera
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Negative, NaN or tiny values are raised to [`MIN_BACKOFF`]
fn backoff_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::ZERO)
        .max(MIN_BACKOFF)
}
