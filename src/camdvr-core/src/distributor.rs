//! Frame fan-out from the capture loop

use tokio::sync::watch;
use tracing::debug;

use camdvr_capture::Frame;
use camdvr_processing::{FrameOutcome, RecorderStats, RecordingConfig, SegmentRecorder};

use crate::preview::PreviewSender;

/// Hands each frame to the preview slot and the segment recorder.
///
/// Runs on the capture thread. The recording config is a cached snapshot,
/// refreshed only when the settings side signals a change.
pub struct FrameDistributor {
    preview: PreviewSender,
    recorder: SegmentRecorder,
    recording_rx: watch::Receiver<RecordingConfig>,
    recording: RecordingConfig,
}

impl FrameDistributor {
    pub fn new(
        preview: PreviewSender,
        recorder: SegmentRecorder,
        mut recording_rx: watch::Receiver<RecordingConfig>,
    ) -> Self {
        let recording = recording_rx.borrow_and_update().clone();
        Self {
            preview,
            recorder,
            recording_rx,
            recording,
        }
    }

    pub fn dispatch(&mut self, frame: Frame) -> FrameOutcome {
        if self.recording_rx.has_changed().unwrap_or(false) {
            self.recording = self.recording_rx.borrow_and_update().clone();
            debug!(
                "recording settings changed (enabled: {}, destination: {:?})",
                self.recording.enable_record, self.recording.destination
            );
        }

        self.preview.publish(frame.clone());
        self.recorder.on_frame(&frame, &self.recording)
    }

    /// Close the open segment, if any
    pub fn close(&mut self) {
        self.recorder.close();
    }

    pub fn recorder_stats(&self) -> &RecorderStats {
        self.recorder.stats()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }
}
