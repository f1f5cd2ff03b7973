//! Capture error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("could not determine stream geometry: {0}")]
    Probe(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream ended")]
    EndOfStream,

    #[error("read interrupted")]
    Interrupted,

    #[error("device error: {0}")]
    Device(String),

    #[error("frame buffer is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CaptureError {
    /// True for failures that happen while establishing a connection, as
    /// opposed to failures of an already streaming source.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            CaptureError::Open { .. } | CaptureError::Probe(_) | CaptureError::Spawn { .. }
        )
    }
}
