//! camdvr-processing - Segmented recording for camdvr
//!
//! Turns the frame stream into time-bounded video segments and keeps the
//! destination directory within its retention window.

pub mod config;
pub mod encoder;
pub mod error;
pub mod retention;
pub mod segment;

pub use config::RecordingConfig;
pub use encoder::{Encoder, FfmpegEncoder, SegmentWriter};
pub use error::{SweepError, WriteError};
pub use retention::{sweep, SweepSummary};
pub use segment::{FrameOutcome, RecorderSettings, RecorderStats, SegmentRecorder};
