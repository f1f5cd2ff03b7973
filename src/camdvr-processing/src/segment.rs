//! Segment recorder
//!
//! Writes the frame stream into time-bounded files. Rotation happens on the
//! capture timestamps of the frames themselves: a segment starts at the
//! timestamp of its first frame and a frame whose timestamp is at least one
//! segment duration past that start opens the next segment and is written
//! there. Geometry changes force a rotation as well.

use chrono::{DateTime, Local, Utc};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use camdvr_capture::{Frame, Geometry};

use crate::config::{is_valid_pattern, RecordingConfig, DEFAULT_FILENAME_PATTERN};
use crate::encoder::{Encoder, SegmentWriter};
use crate::error::WriteError;
use crate::retention;

/// Recorder tuning that does not come from the settings store
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Consecutive open/write failures before recording is suspended
    pub max_write_failures: u32,
    /// How long recording stays suspended before the destination is retried
    pub write_retry_interval: Duration,
    /// Minimum spacing of retention sweeps while one segment stays open
    pub sweep_interval: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_write_failures: 3,
            write_retry_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// What happened to one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Written,
    /// Recording is disabled
    Idle,
    /// Recording is enabled but the frame could not be stored
    Dropped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecorderStats {
    pub segments_opened: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub write_errors: u64,
}

/// The one open output file
struct RecordingSegment {
    writer: Box<dyn SegmentWriter>,
    path: PathBuf,
    started_at: DateTime<Utc>,
    geometry: Geometry,
    frames: u64,
}

pub struct SegmentRecorder {
    encoder: Arc<dyn Encoder>,
    settings: RecorderSettings,
    current: Option<RecordingSegment>,
    last_path: Option<PathBuf>,
    consecutive_failures: u32,
    suspended_until: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    stats: RecorderStats,
}

impl SegmentRecorder {
    pub fn new(encoder: Arc<dyn Encoder>, settings: RecorderSettings) -> Self {
        Self {
            encoder,
            settings,
            current: None,
            last_path: None,
            consecutive_failures: 0,
            suspended_until: None,
            last_sweep: None,
            stats: RecorderStats::default(),
        }
    }

    /// Feed one frame. Errors are absorbed here: they are logged, counted and
    /// reflected in the outcome, never returned to the capture loop.
    pub fn on_frame(&mut self, frame: &Frame, config: &RecordingConfig) -> FrameOutcome {
        if !config.enable_record {
            if self.current.is_some() {
                info!("recording disabled, closing current segment");
                self.close();
            }
            self.consecutive_failures = 0;
            self.suspended_until = None;
            return FrameOutcome::Idle;
        }

        if let Some(until) = self.suspended_until {
            if frame.timestamp < until {
                self.stats.frames_dropped += 1;
                return FrameOutcome::Dropped;
            }
            debug!("retrying suspended recording");
        }

        let rotated = self.needs_rotation(frame, config);
        if rotated {
            self.close();
            match self.open_segment(frame, config) {
                Ok(segment) => {
                    self.suspended_until = None;
                    self.current = Some(segment);
                }
                Err(e) => {
                    self.record_failure(frame.timestamp, e);
                    self.stats.frames_dropped += 1;
                    return FrameOutcome::Dropped;
                }
            }
        }

        let outcome = self.write_current(frame);

        if config.retention_enabled && self.sweep_due(frame.timestamp, rotated) {
            self.run_sweep(frame.timestamp, config);
        }

        outcome
    }

    /// Flush and close the open segment, if any
    pub fn close(&mut self) {
        if let Some(segment) = self.current.take() {
            let RecordingSegment { writer, path, frames, .. } = segment;
            match writer.finish() {
                Ok(()) => info!("finalized segment {:?} ({} frames)", path, frames),
                Err(e) => warn!("error finalizing segment {:?}: {}", path, e),
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// Path of the segment currently open for writing
    pub fn active_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.path.as_path())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_until.is_some()
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    fn needs_rotation(&self, frame: &Frame, config: &RecordingConfig) -> bool {
        match &self.current {
            None => true,
            Some(segment) if segment.geometry != frame.geometry => {
                info!(
                    "frame geometry changed {} -> {}, rotating",
                    segment.geometry, frame.geometry
                );
                true
            }
            Some(segment) => frame.timestamp - segment.started_at >= config.segment_duration(),
        }
    }

    fn open_segment(
        &mut self,
        frame: &Frame,
        config: &RecordingConfig,
    ) -> Result<RecordingSegment, WriteError> {
        config.validate()?;

        fs::create_dir_all(&config.destination).map_err(|source| WriteError::Destination {
            path: config.destination.clone(),
            source,
        })?;

        let path = self.unique_segment_path(config, frame.timestamp);
        let writer = self.encoder.open(&path, frame.geometry, config)?;

        self.stats.segments_opened += 1;
        self.last_path = Some(path.clone());
        info!("opened segment {:?} ({})", path, frame.geometry);

        Ok(RecordingSegment {
            writer,
            path,
            started_at: frame.timestamp,
            geometry: frame.geometry,
            frames: 0,
        })
    }

    fn write_current(&mut self, frame: &Frame) -> FrameOutcome {
        let Some(segment) = self.current.as_mut() else {
            self.stats.frames_dropped += 1;
            return FrameOutcome::Dropped;
        };

        match segment.writer.write_frame(frame) {
            Ok(()) => {
                segment.frames += 1;
                self.stats.frames_written += 1;
                self.consecutive_failures = 0;
                FrameOutcome::Written
            }
            Err(e) => {
                self.record_failure(frame.timestamp, e);
                self.stats.frames_dropped += 1;
                FrameOutcome::Dropped
            }
        }
    }

    fn record_failure(&mut self, at: DateTime<Utc>, err: WriteError) {
        self.consecutive_failures += 1;
        self.stats.write_errors += 1;
        warn!(
            "recording error ({}/{}): {}",
            self.consecutive_failures, self.settings.max_write_failures, err
        );

        if self.consecutive_failures >= self.settings.max_write_failures {
            let retry = chrono::Duration::from_std(self.settings.write_retry_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
            if self.suspended_until.is_none() {
                error!(
                    "recording suspended after {} consecutive failures, retrying every {:?}",
                    self.consecutive_failures, self.settings.write_retry_interval
                );
            }
            self.suspended_until = Some(at + retry);
            self.close();
        }
    }

    fn sweep_due(&self, now: DateTime<Utc>, rotated: bool) -> bool {
        if rotated {
            return true;
        }
        match self.last_sweep {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.settings.sweep_interval)
                .unwrap_or(false),
        }
    }

    fn run_sweep(&mut self, now: DateTime<Utc>, config: &RecordingConfig) {
        self.last_sweep = Some(now);
        match retention::sweep_excluding(
            &config.destination,
            config.retention_age_days,
            self.active_path(),
        ) {
            Ok(summary) if summary.deleted > 0 || summary.errors > 0 => {
                info!(
                    "retention: deleted {} file(s), {} error(s) in {:?}",
                    summary.deleted, summary.errors, config.destination
                );
            }
            Ok(_) => {}
            Err(e) => warn!("retention sweep failed: {}", e),
        }
    }

    /// Deterministic name from the timestamp; `_1`, `_2`, … on collision
    fn unique_segment_path(&self, config: &RecordingConfig, at: DateTime<Utc>) -> PathBuf {
        let stem = format_stem(&config.filename_pattern, at);

        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{}.{}", stem, config.container)
            } else {
                format!("{}_{}.{}", stem, n, config.container)
            };
            let candidate = config.destination.join(name);
            let taken = candidate.exists() || self.last_path.as_deref() == Some(candidate.as_path());
            if !taken {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Drop for SegmentRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn format_stem(pattern: &str, at: DateTime<Utc>) -> String {
    let local = at.with_timezone(&Local);
    let pattern = if is_valid_pattern(pattern) { pattern } else { DEFAULT_FILENAME_PATTERN };

    let mut stem = String::new();
    if write!(stem, "{}", local.format(pattern)).is_err() {
        stem = local.format(DEFAULT_FILENAME_PATTERN).to_string();
    }
    stem
}
