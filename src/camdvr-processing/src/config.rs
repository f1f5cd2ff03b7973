//! Recording settings

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::WriteError;

pub const DEFAULT_FPS: u32 = 20;
pub const DEFAULT_FOURCC: &str = "XVID";
pub const DEFAULT_FILENAME_PATTERN: &str = "%d.%m.%Y_%H.%M.%S";
pub const DEFAULT_CONTAINER: &str = "avi";

/// Recording configuration supplied by the settings store.
///
/// The recorder applies a new snapshot at its next rotation decision; fields
/// that shape a segment (destination, codec, fps) never change mid-segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory that receives segment files
    pub destination: PathBuf,

    /// Segment length in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u64,

    /// Delete old segments automatically
    #[serde(default)]
    pub retention_enabled: bool,

    /// Age in days at which segments are deleted
    #[serde(default = "default_retention_days")]
    pub retention_age_days: u32,

    /// Master switch for recording
    #[serde(default)]
    pub enable_record: bool,

    /// Output container framerate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Codec fourcc, e.g. XVID or MJPG
    #[serde(default = "default_fourcc")]
    pub fourcc: String,

    /// strftime pattern for segment file names (local time)
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,

    /// File extension / container
    #[serde(default = "default_container")]
    pub container: String,
}

fn default_segment_duration() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    7
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_fourcc() -> String {
    DEFAULT_FOURCC.to_string()
}

fn default_filename_pattern() -> String {
    DEFAULT_FILENAME_PATTERN.to_string()
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("recordings"),
            segment_duration_secs: default_segment_duration(),
            retention_enabled: false,
            retention_age_days: default_retention_days(),
            enable_record: false,
            fps: DEFAULT_FPS,
            fourcc: default_fourcc(),
            filename_pattern: default_filename_pattern(),
            container: default_container(),
        }
    }
}

impl RecordingConfig {
    /// Segment length; never shorter than one second
    pub fn segment_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.segment_duration_secs.max(1) as i64)
    }

    /// Reject settings that cannot produce a segment
    pub fn validate(&self) -> Result<(), WriteError> {
        if self.destination.as_os_str().is_empty() {
            return Err(WriteError::InvalidConfig("destination is empty".to_string()));
        }
        if self.segment_duration_secs == 0 {
            return Err(WriteError::InvalidConfig("segment duration must be positive".to_string()));
        }
        if self.fps == 0 {
            return Err(WriteError::InvalidConfig("fps must be positive".to_string()));
        }
        if self.fourcc.trim().is_empty() {
            return Err(WriteError::InvalidConfig("codec fourcc is empty".to_string()));
        }
        if self.container.is_empty() || self.container.contains(['/', '\\', '.']) {
            return Err(WriteError::InvalidConfig(format!("bad container: {:?}", self.container)));
        }
        if !is_valid_pattern(&self.filename_pattern) {
            return Err(WriteError::InvalidConfig(format!(
                "bad filename pattern: {:?}",
                self.filename_pattern
            )));
        }
        Ok(())
    }
}

/// A pattern is usable when chrono understands every specifier and the
/// result cannot escape the destination directory
pub(crate) fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
        && !pattern.contains(['/', '\\'])
        && StrftimeItems::new(pattern).all(|item| !matches!(item, Item::Error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recording_settings() {
        let config = RecordingConfig::default();
        assert_eq!(config.segment_duration_secs, 3600);
        assert_eq!(config.retention_age_days, 7);
        assert!(!config.enable_record);
        assert!(!config.retention_enabled);
        assert_eq!(config.fps, 20);
        assert_eq!(config.fourcc, "XVID");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RecordingConfig::default();
        config.segment_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RecordingConfig::default();
        config.filename_pattern = "%Q".to_string();
        assert!(config.validate().is_err());

        let mut config = RecordingConfig::default();
        config.filename_pattern = "../%Y".to_string();
        assert!(config.validate().is_err());

        let mut config = RecordingConfig::default();
        config.container = "a.vi".to_string();
        assert!(config.validate().is_err());
    }
}
