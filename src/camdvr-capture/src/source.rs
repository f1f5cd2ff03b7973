//! Frame Source contract

use std::fmt;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::CaptureError;
use crate::frame::{Frame, Geometry};

/// An open camera stream.
///
/// Only the capture thread calls `read_frame`; other threads reach the source
/// exclusively through its [`Interrupter`].
pub trait FrameSource: Send {
    /// Geometry negotiated when the source was opened
    fn geometry(&self) -> Geometry;

    /// Block until the next frame is available.
    ///
    /// Any error means the stream is unusable and must be reopened.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Handle that makes a blocked `read_frame` return promptly
    fn interrupter(&self) -> Interrupter;
}

/// Opens Frame Sources for a connection config
pub trait SourceOpener: Send + Sync {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Wakes a source blocked in `read_frame` from another thread.
///
/// Interrupting never releases the source; the owning thread still drops it.
#[derive(Clone, Default)]
pub struct Interrupter(Option<Arc<dyn Fn() + Send + Sync>>);

impl Interrupter {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// Interrupter for sources whose reads always return on their own
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn interrupt(&self) {
        if let Some(f) = &self.0 {
            f();
        }
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interrupter").field(&self.0.is_some()).finish()
    }
}
