//! camdvr-capture - Camera frame acquisition for camdvr
//!
//! Defines the frame model and the Frame Source contract, and provides an
//! FFmpeg-backed source for local capture devices and network streams.

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod source;

pub use config::{ConnectionConfig, SourceKind};
pub use error::CaptureError;
pub use ffmpeg::{FfmpegOpener, FfmpegSource};
pub use frame::{Frame, Geometry};
pub use source::{FrameSource, Interrupter, SourceOpener};
