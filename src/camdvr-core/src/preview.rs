//! Latest-wins preview channel
//!
//! One slot holding the most recent frame. Publishing never blocks and
//! overwrites a frame nobody looked at; a slow viewer only ever skips frames.

use std::sync::Arc;
use tokio::sync::watch;

use camdvr_capture::Frame;

#[derive(Clone)]
pub struct PreviewSender {
    tx: Arc<watch::Sender<Option<Frame>>>,
}

impl PreviewSender {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the slot contents, dropping the previous frame
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(frame));
    }

    /// Empty the slot (stream stopped)
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> PreviewReceiver {
        PreviewReceiver { rx: self.tx.subscribe() }
    }
}

impl Default for PreviewSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Viewer side of the preview slot
#[derive(Clone)]
pub struct PreviewReceiver {
    rx: watch::Receiver<Option<Frame>>,
}

impl PreviewReceiver {
    /// The newest frame, if one arrived since the last call
    pub fn try_take(&mut self) -> Option<Frame> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next published frame. Returns `None` once the supervisor
    /// is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}
