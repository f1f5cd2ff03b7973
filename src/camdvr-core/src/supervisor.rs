//! Connection state machine
//!
//! The supervisor owns the camera connection. A single capture thread reads
//! frames, feeds the distributor and, when the stream breaks, runs the
//! reconnect loop itself. The control side (CLI, signal handler) only flips
//! flags, wakes the backoff wait and interrupts a blocked read; the source
//! handle and the open segment are released on the capture thread.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use camdvr_capture::{CaptureError, ConnectionConfig, FrameSource, Interrupter, SourceOpener};
use camdvr_db::SettingsStore;
use camdvr_processing::{Encoder, FrameOutcome, RecorderSettings, RecordingConfig, SegmentRecorder};

use crate::distributor::FrameDistributor;
use crate::preview::{PreviewReceiver, PreviewSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Delay schedule between reopen attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Wait before the first attempt
    pub backoff: Duration,
    /// Growth per failed attempt (1.0 = constant)
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// `None` retries until `disconnect()`
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.backoff.as_secs_f64() * factor;
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff);
        delay.min(self.max_backoff.max(self.backoff))
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("already {0}")]
    AlreadyActive(ConnectionState),

    #[error(transparent)]
    Source(#[from] CaptureError),

    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("failed to spawn capture thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Counters since the supervisor was created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub frames_captured: u64,
    pub frames_recorded: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub segments_opened: u64,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_recorded: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
    segments_opened: AtomicU64,
}

struct Control {
    state: ConnectionState,
    /// Bumped by every disconnect so an in-flight connect can tell it was
    /// cancelled
    generation: u64,
}

struct Shared {
    control: Mutex<Control>,
    /// Signalled when `running` is cleared; ends the backoff wait early
    wake: Condvar,
    state_tx: watch::Sender<ConnectionState>,
    running: AtomicBool,
    /// Set while a retry loop is requested or running
    reconnect_pending: AtomicBool,
    interrupter: Mutex<Option<Interrupter>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }

    fn transition(&self, ctl: &mut Control, next: ConnectionState) {
        if ctl.state != next {
            debug!("state {} -> {}", ctl.state, next);
            ctl.state = next;
            self.state_tx.send_replace(next);
        }
    }

    /// Move to `next` unless a disconnect is under way
    fn transition_if_running(&self, next: ConnectionState) -> bool {
        let mut ctl = self.control();
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.transition(&mut ctl, next);
        true
    }

    /// Sleep for `delay`; returns false if woken by a disconnect
    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let ctl = self.control();
        let _ = self
            .wake
            .wait_timeout_while(ctl, delay, |_| self.running.load(Ordering::SeqCst))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.running.load(Ordering::SeqCst)
    }

    fn set_interrupter(&self, interrupter: Option<Interrupter>) {
        *lock(&self.interrupter) = interrupter;
    }

    fn interrupt(&self) {
        if let Some(interrupter) = lock(&self.interrupter).as_ref() {
            interrupter.interrupt();
        }
    }

    fn stats(&self) -> SupervisorStats {
        let c = &self.counters;
        SupervisorStats {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_recorded: c.frames_recorded.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            segments_opened: c.segments_opened.load(Ordering::Relaxed),
        }
    }
}

fn persist_connection(settings: &dyn SettingsStore, config: &ConnectionConfig) {
    if let Err(e) = settings.save_connection_config(config) {
        warn!("failed to persist camera settings: {:#}", e);
    }
}

/// Supervises one camera connection and the recording fed by it
pub struct Supervisor {
    shared: Arc<Shared>,
    opener: Arc<dyn SourceOpener>,
    encoder: Arc<dyn Encoder>,
    settings: Arc<dyn SettingsStore>,
    preview: PreviewSender,
    recording_tx: watch::Sender<RecordingConfig>,
    policy: ReconnectPolicy,
    recorder_settings: RecorderSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Recording settings are loaded from `settings` once here; later
    /// changes go through [`Supervisor::apply_recording_config`].
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        encoder: Arc<dyn Encoder>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let recording = settings.get_recording_config().unwrap_or_else(|e| {
            warn!("failed to load recording settings, using defaults: {:#}", e);
            RecordingConfig::default()
        });
        let (recording_tx, _) = watch::channel(recording);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                }),
                wake: Condvar::new(),
                state_tx,
                running: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                interrupter: Mutex::new(None),
                counters: Counters::default(),
            }),
            opener,
            encoder,
            settings,
            preview: PreviewSender::new(),
            recording_tx,
            policy: ReconnectPolicy::default(),
            recorder_settings: RecorderSettings::default(),
            worker: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_recorder_settings(mut self, settings: RecorderSettings) -> Self {
        self.recorder_settings = settings;
        self
    }

    /// Open the camera and start streaming.
    ///
    /// Fails without retrying if the camera cannot be opened; see
    /// [`Supervisor::start`] for the retrying variant.
    pub fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        self.open_and_launch(config, false)
    }

    /// Like [`Supervisor::connect`], but an unavailable camera is retried in
    /// the background under the reconnect policy instead of failing.
    ///
    /// A disconnect while the first open is in flight wins: the call returns
    /// [`ConnectError::Cancelled`] and no retry loop is left behind.
    pub fn start(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        self.open_and_launch(config, true)
    }

    /// Stop streaming and release everything. Safe to call in any state.
    pub fn disconnect(&self) {
        {
            let mut ctl = self.shared.control();
            if ctl.state != ConnectionState::Disconnected {
                ctl.generation += 1;
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.transition(&mut ctl, ConnectionState::Stopping);
            }
        }
        self.shared.wake.notify_all();
        self.shared.interrupt();

        // The capture thread closes the segment and drops the source
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }

        self.shared.set_interrupter(None);
        self.shared.reconnect_pending.store(false, Ordering::SeqCst);
        self.preview.clear();

        let mut ctl = self.shared.control();
        if ctl.state == ConnectionState::Stopping {
            self.shared.transition(&mut ctl, ConnectionState::Disconnected);
            info!("disconnected");
        }
    }

    /// Drop the current stream and reopen it after the backoff.
    ///
    /// No-op while a retry loop is already requested or running, and while
    /// disconnected.
    pub fn reconnect(&self) {
        {
            let ctl = self.shared.control();
            match ctl.state {
                ConnectionState::Streaming | ConnectionState::Connecting => {}
                other => {
                    debug!("reconnect ignored while {}", other);
                    return;
                }
            }
            if self.shared.reconnect_pending.swap(true, Ordering::SeqCst) {
                debug!("reconnect already in progress");
                return;
            }
        }
        info!("reconnect requested");
        self.shared.interrupt();
    }

    /// Replace the camera: tear down the current connection and start a new
    /// one with `config`.
    pub fn apply_connection_config(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        info!("applying camera settings: {}", config);
        self.disconnect();
        self.start(config)
    }

    /// Persist new recording settings and hand them to the recorder, which
    /// picks them up with the next frame.
    pub fn apply_recording_config(&self, config: RecordingConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.settings.save_recording_config(&config)?;
        info!(
            "applied recording settings (enabled: {}, destination: {:?})",
            config.enable_record, config.destination
        );
        self.recording_tx.send_replace(config);
        Ok(())
    }

    pub fn recording_config(&self) -> RecordingConfig {
        self.recording_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.control().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_preview(&self) -> PreviewReceiver {
        self.preview.subscribe()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.shared.stats()
    }

    fn open_and_launch(&self, config: ConnectionConfig, retry: bool) -> Result<(), ConnectError> {
        let generation = self.begin(ConnectionState::Connecting)?;
        info!("connecting to {}", config);

        let err = match self.opener.open(&config) {
            Ok(source) => return self.launch(config, Some(source), generation),
            Err(e) => e,
        };
        warn!("failed to open {}: {}", config, err);

        {
            let mut ctl = self.shared.control();
            if ctl.generation != generation || !self.shared.running.load(Ordering::SeqCst) {
                debug!("connect to {} cancelled", config);
                return Err(ConnectError::Cancelled);
            }
            if !retry || !err.is_connect_error() {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.transition(&mut ctl, ConnectionState::Disconnected);
                return Err(err.into());
            }
            self.shared.reconnect_pending.store(true, Ordering::SeqCst);
            self.shared.transition(&mut ctl, ConnectionState::Reconnecting);
        }

        info!("{} unavailable, retrying in background", config);
        self.launch(config, None, generation)
    }

    /// Leave `Disconnected` for `next`, reaping a capture thread that ended
    /// on its own
    fn begin(&self, next: ConnectionState) -> Result<u64, ConnectError> {
        let generation = {
            let mut ctl = self.shared.control();
            if ctl.state != ConnectionState::Disconnected {
                return Err(ConnectError::AlreadyActive(ctl.state));
            }
            self.shared.running.store(true, Ordering::SeqCst);
            self.shared.reconnect_pending.store(false, Ordering::SeqCst);
            self.shared.transition(&mut ctl, next);
            ctl.generation
        };

        if let Some(stale) = lock(&self.worker).take() {
            let _ = stale.join();
        }
        Ok(generation)
    }

    fn launch(
        &self,
        config: ConnectionConfig,
        source: Option<Box<dyn FrameSource>>,
        generation: u64,
    ) -> Result<(), ConnectError> {
        {
            let mut ctl = self.shared.control();
            if ctl.generation != generation || !self.shared.running.load(Ordering::SeqCst) {
                return Err(ConnectError::Cancelled);
            }
            if let Some(source) = &source {
                self.shared.set_interrupter(Some(source.interrupter()));
                self.shared.transition(&mut ctl, ConnectionState::Streaming);
            }
        }

        if let Some(source) = &source {
            info!("streaming from {} ({})", config, source.geometry());
            persist_connection(&*self.settings, &config);
        }

        let distributor = FrameDistributor::new(
            self.preview.clone(),
            SegmentRecorder::new(self.encoder.clone(), self.recorder_settings.clone()),
            self.recording_tx.subscribe(),
        );
        let capture = CaptureLoop {
            shared: self.shared.clone(),
            opener: self.opener.clone(),
            settings: self.settings.clone(),
            policy: self.policy.clone(),
            config,
        };

        let spawned = thread::Builder::new()
            .name("camdvr-capture".to_string())
            .spawn(move || capture.run(source, distributor));

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("failed to spawn capture thread: {}", e);
                let mut ctl = self.shared.control();
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_interrupter(None);
                self.shared.transition(&mut ctl, ConnectionState::Disconnected);
                Err(ConnectError::Thread(e))
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Reopen {
    Opened(Box<dyn FrameSource>),
    Stopped,
    GaveUp,
}

/// State moved onto the capture thread
struct CaptureLoop {
    shared: Arc<Shared>,
    opener: Arc<dyn SourceOpener>,
    settings: Arc<dyn SettingsStore>,
    policy: ReconnectPolicy,
    config: ConnectionConfig,
}

impl CaptureLoop {
    fn run(self, mut source: Option<Box<dyn FrameSource>>, mut distributor: FrameDistributor) {
        debug!("capture thread started for {}", self.config);
        let mut sequence = 0u64;
        let mut gave_up = false;

        while self.shared.running.load(Ordering::SeqCst) {
            if source.is_none() {
                match self.reopen() {
                    Reopen::Opened(reopened) => source = Some(reopened),
                    Reopen::Stopped => break,
                    Reopen::GaveUp => {
                        gave_up = true;
                        break;
                    }
                }
            }

            let Some(stream) = source.as_mut() else {
                continue;
            };

            if self.shared.reconnect_pending.load(Ordering::SeqCst) {
                self.release(&mut source);
                continue;
            }

            match stream.read_frame() {
                Ok(frame) => {
                    let frame = frame.with_sequence(sequence);
                    sequence += 1;
                    self.record(&mut distributor, frame);
                }
                Err(e) => {
                    if !self.shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    match e {
                        CaptureError::Interrupted => debug!("read interrupted"),
                        e => warn!("stream from {} failed: {}", self.config, e),
                    }
                    self.shared.reconnect_pending.store(true, Ordering::SeqCst);
                    self.release(&mut source);
                }
            }
        }

        distributor.close();
        self.release(&mut source);

        if gave_up {
            let mut ctl = self.shared.control();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.reconnect_pending.store(false, Ordering::SeqCst);
            if ctl.state != ConnectionState::Stopping {
                self.shared.transition(&mut ctl, ConnectionState::Disconnected);
            }
        }
        debug!("capture thread exiting after {} frames", sequence);
    }

    fn record(&self, distributor: &mut FrameDistributor, frame: camdvr_capture::Frame) {
        let counters = &self.shared.counters;
        counters.frames_captured.fetch_add(1, Ordering::Relaxed);

        let opened_before = distributor.recorder_stats().segments_opened;
        match distributor.dispatch(frame) {
            FrameOutcome::Written => {
                counters.frames_recorded.fetch_add(1, Ordering::Relaxed);
            }
            FrameOutcome::Dropped => {
                counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            FrameOutcome::Idle => {}
        }
        let opened = distributor.recorder_stats().segments_opened - opened_before;
        if opened > 0 {
            counters.segments_opened.fetch_add(opened, Ordering::Relaxed);
        }
    }

    /// Drop the source handle; the stream is no longer `Streaming`
    fn release(&self, source: &mut Option<Box<dyn FrameSource>>) {
        self.shared.set_interrupter(None);
        if source.take().is_some() {
            debug!("released source for {}", self.config);
        }
    }

    fn reopen(&self) -> Reopen {
        self.shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0u32;

        loop {
            if !self.shared.transition_if_running(ConnectionState::Reconnecting) {
                return Reopen::Stopped;
            }
            attempt += 1;
            let delay = self.policy.delay(attempt);
            info!("reconnecting to {} in {:?} (attempt {})", self.config, delay, attempt);

            if !self.shared.sleep_unless_stopped(delay) {
                return Reopen::Stopped;
            }
            if !self.shared.transition_if_running(ConnectionState::Connecting) {
                return Reopen::Stopped;
            }

            match self.opener.open(&self.config) {
                Ok(source) => {
                    {
                        let mut ctl = self.shared.control();
                        if !self.shared.running.load(Ordering::SeqCst) {
                            return Reopen::Stopped;
                        }
                        self.shared.set_interrupter(Some(source.interrupter()));
                        self.shared.reconnect_pending.store(false, Ordering::SeqCst);
                        self.shared.transition(&mut ctl, ConnectionState::Streaming);
                    }
                    info!("reconnected to {} ({})", self.config, source.geometry());
                    persist_connection(&*self.settings, &self.config);
                    return Reopen::Opened(source);
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt, e);
                    if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                        error!("giving up on {} after {} attempts", self.config, attempt);
                        return Reopen::GaveUp;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use camdvr_capture::{Frame, Geometry};
    use camdvr_db::MemorySettings;
    use camdvr_processing::{SegmentWriter, WriteError};

    const GEOMETRY: Geometry = Geometry { width: 2, height: 2 };

    /// Camera double: opens succeed once `available_after` has passed; the
    /// first stream can be made to break after a number of frames.
    #[derive(Default)]
    struct TestCamera {
        available_after: Mutex<Option<Instant>>,
        break_first_stream_after: Mutex<Option<u64>>,
        outage: Mutex<Duration>,
        /// How long each open blocks before answering
        open_delay: Mutex<Duration>,
        attempts: AtomicUsize,
        opens: AtomicUsize,
        live_sources: AtomicUsize,
        next_pixel: AtomicU64,
        broke_at: Mutex<Option<Instant>>,
        opened_at: Mutex<Vec<Instant>>,
        last_config: Mutex<Option<ConnectionConfig>>,
    }

    impl TestCamera {
        fn unavailable_for(&self, outage: Duration) {
            *self.available_after.lock().unwrap() = Some(Instant::now() + outage);
        }

        fn break_first_stream(&self, after_frames: u64, outage: Duration) {
            *self.break_first_stream_after.lock().unwrap() = Some(after_frames);
            *self.outage.lock().unwrap() = outage;
        }
    }

    struct TestOpener(Arc<TestCamera>);

    impl SourceOpener for TestOpener {
        fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
            let camera = &self.0;
            camera.attempts.fetch_add(1, Ordering::SeqCst);
            *camera.last_config.lock().unwrap() = Some(config.clone());
            thread::sleep(*camera.open_delay.lock().unwrap());

            if camera.available_after.lock().unwrap().is_some_and(|t| Instant::now() < t) {
                return Err(CaptureError::Open {
                    target: config.redacted_url(),
                    reason: "camera offline".to_string(),
                });
            }

            camera.opens.fetch_add(1, Ordering::SeqCst);
            camera.live_sources.fetch_add(1, Ordering::SeqCst);
            camera.opened_at.lock().unwrap().push(Instant::now());
            Ok(Box::new(TestSource {
                camera: camera.clone(),
                frames_left: camera.break_first_stream_after.lock().unwrap().take(),
                interrupted: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    struct TestSource {
        camera: Arc<TestCamera>,
        frames_left: Option<u64>,
        interrupted: Arc<AtomicBool>,
    }

    impl FrameSource for TestSource {
        fn geometry(&self) -> Geometry {
            GEOMETRY
        }

        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            thread::sleep(Duration::from_millis(2));
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(CaptureError::Interrupted);
            }
            if let Some(left) = self.frames_left.as_mut() {
                if *left == 0 {
                    *self.camera.broke_at.lock().unwrap() = Some(Instant::now());
                    let outage = *self.camera.outage.lock().unwrap();
                    self.camera.unavailable_for(outage);
                    return Err(CaptureError::EndOfStream);
                }
                *left -= 1;
            }

            let pixel = self.camera.next_pixel.fetch_add(1, Ordering::SeqCst);
            let mut data = vec![0u8; GEOMETRY.frame_len()];
            data[..8].copy_from_slice(&pixel.to_le_bytes());
            Frame::new(Bytes::from(data), GEOMETRY, Utc::now())
        }

        fn interrupter(&self) -> Interrupter {
            let flag = self.interrupted.clone();
            Interrupter::new(move || flag.store(true, Ordering::SeqCst))
        }
    }

    impl Drop for TestSource {
        fn drop(&mut self) {
            self.camera.live_sources.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Records (sequence, pixel counter) of every written frame
    #[derive(Default)]
    struct TestEncoder {
        opened: AtomicUsize,
        live: AtomicUsize,
        written: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    struct TestWriter {
        encoder: Arc<TestEncoder>,
    }

    struct SharedEncoder(Arc<TestEncoder>);

    impl Encoder for SharedEncoder {
        fn open(
            &self,
            _path: &Path,
            _geometry: Geometry,
            _config: &RecordingConfig,
        ) -> Result<Box<dyn SegmentWriter>, WriteError> {
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            self.0.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestWriter { encoder: self.0.clone() }))
        }
    }

    impl SegmentWriter for TestWriter {
        fn write_frame(&mut self, frame: &Frame) -> Result<(), WriteError> {
            let mut pixel = [0u8; 8];
            pixel.copy_from_slice(&frame.data[..8]);
            self.encoder
                .written
                .lock()
                .unwrap()
                .push((frame.sequence, u64::from_le_bytes(pixel)));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), WriteError> {
            Ok(())
        }
    }

    impl Drop for TestWriter {
        fn drop(&mut self) {
            self.encoder.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        camera: Arc<TestCamera>,
        encoder: Arc<TestEncoder>,
        settings: Arc<MemorySettings>,
        supervisor: Supervisor,
        _tmp: tempfile::TempDir,
    }

    fn harness(enable_record: bool, policy: ReconnectPolicy) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let camera = Arc::new(TestCamera::default());
        let encoder = Arc::new(TestEncoder::default());
        let settings = Arc::new(MemorySettings::new(RecordingConfig {
            destination: tmp.path().to_path_buf(),
            enable_record,
            ..RecordingConfig::default()
        }));

        let supervisor = Supervisor::new(
            Arc::new(TestOpener(camera.clone())),
            Arc::new(SharedEncoder(encoder.clone())),
            settings.clone(),
        )
        .with_policy(policy);

        Harness { camera, encoder, settings, supervisor, _tmp: tmp }
    }

    fn policy(backoff_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Duration::from_millis(backoff_ms),
            ..ReconnectPolicy::default()
        }
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_policy_delay() {
        let constant = ReconnectPolicy::default();
        assert_eq!(constant.delay(1), Duration::from_secs(5));
        assert_eq!(constant.delay(10), Duration::from_secs(5));

        let growing = ReconnectPolicy {
            backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            max_attempts: None,
        };
        assert_eq!(growing.delay(1), Duration::from_secs(1));
        assert_eq!(growing.delay(3), Duration::from_secs(4));
        assert_eq!(growing.delay(5), Duration::from_secs(10));
        assert_eq!(growing.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_disconnect_right_after_connect() {
        let h = harness(true, policy(50));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();
        h.supervisor.disconnect();

        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(h.camera.live_sources.load(Ordering::SeqCst), 0);
        assert_eq!(h.encoder.live.load(Ordering::SeqCst), 0);

        // Idempotent
        h.supervisor.disconnect();
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let h = harness(false, policy(50));
        h.camera.unavailable_for(Duration::from_secs(60));

        let err = h.supervisor.connect(ConnectionConfig::local(0)).unwrap_err();
        assert!(matches!(err, ConnectError::Source(_)));
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(h.settings.connection_saves(), 0);

        // Failed connect does not start a retry loop
        thread::sleep(Duration::from_millis(150));
        assert_eq!(h.camera.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_while_active_is_rejected() {
        let h = harness(false, policy(50));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        let err = h.supervisor.connect(ConnectionConfig::local(1)).unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyActive(ConnectionState::Streaming)));

        h.supervisor.disconnect();
        assert_eq!(h.camera.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recorder_sees_frames_in_capture_order() {
        let h = harness(true, policy(50));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.encoder.written.lock().unwrap().len() >= 40
        }));
        h.supervisor.disconnect();

        let written = h.encoder.written.lock().unwrap().clone();
        for (i, (sequence, pixel)) in written.iter().enumerate() {
            assert_eq!(*sequence, i as u64);
            assert_eq!(*pixel, i as u64);
        }
        assert_eq!(h.encoder.opened.load(Ordering::SeqCst), 1);

        let stats = h.supervisor.stats();
        assert_eq!(stats.frames_recorded, written.len() as u64);
        assert_eq!(stats.frames_captured, written.len() as u64);
        assert_eq!(stats.segments_opened, 1);
    }

    #[test]
    fn test_read_failure_reconnects_after_backoff() {
        // Scaled down: backoff 100ms, camera back 170ms after the failure
        let h = harness(true, policy(100));
        h.camera.break_first_stream(5, Duration::from_millis(170));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.camera.opens.load(Ordering::SeqCst) == 2
        }));
        assert!(wait_for(Duration::from_secs(1), || {
            h.supervisor.state() == ConnectionState::Streaming
        }));

        let broke_at = h.camera.broke_at.lock().unwrap().unwrap();
        let reopened_at = h.camera.opened_at.lock().unwrap()[1];
        let gap = reopened_at - broke_at;
        assert!(gap >= Duration::from_millis(170), "reopened too early: {:?}", gap);
        assert!(gap < Duration::from_millis(400), "reopened too late: {:?}", gap);

        // One failed attempt at ~100ms, success at ~200ms
        assert_eq!(h.camera.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(h.supervisor.stats().reconnects, 1);

        // The stream resumes without gaps or duplicates
        assert!(wait_for(Duration::from_secs(5), || {
            h.encoder.written.lock().unwrap().len() >= 15
        }));
        h.supervisor.disconnect();
        let written = h.encoder.written.lock().unwrap().clone();
        for (i, (sequence, pixel)) in written.iter().enumerate() {
            assert_eq!(*sequence, i as u64);
            assert_eq!(*pixel, i as u64);
        }
        // The segment stayed open across the outage
        assert_eq!(h.encoder.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnect_spam_runs_one_retry_loop() {
        let h = Arc::new(harness(false, policy(200)));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            h.supervisor.stats().frames_captured >= 3
        }));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let h = h.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        h.supervisor.reconnect();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert!(wait_for(Duration::from_secs(5), || {
            h.camera.opens.load(Ordering::SeqCst) == 2
                && h.supervisor.state() == ConnectionState::Streaming
        }));
        thread::sleep(Duration::from_millis(300));

        assert_eq!(h.camera.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.camera.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.supervisor.stats().reconnects, 1);
        h.supervisor.disconnect();
    }

    #[test]
    fn test_reconnect_ignored_while_disconnected() {
        let h = harness(false, policy(20));
        h.supervisor.reconnect();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(h.camera.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let h = harness(true, ReconnectPolicy {
            max_attempts: Some(2),
            ..policy(20)
        });
        h.camera.break_first_stream(3, Duration::from_secs(3600));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.camera.attempts.load(Ordering::SeqCst) == 3
                && h.supervisor.state() == ConnectionState::Disconnected
        }));
        assert_eq!(h.camera.live_sources.load(Ordering::SeqCst), 0);
        assert!(wait_for(Duration::from_secs(1), || h.encoder.live.load(Ordering::SeqCst) == 0));

        // A fresh connect works once the camera is back
        *h.camera.available_after.lock().unwrap() = None;
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();
        assert_eq!(h.supervisor.state(), ConnectionState::Streaming);
        h.supervisor.disconnect();
    }

    #[test]
    fn test_disconnect_during_backoff_returns_promptly() {
        let h = harness(true, policy(10_000));
        h.camera.break_first_stream(3, Duration::from_secs(3600));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.supervisor.state() == ConnectionState::Reconnecting
        }));
        assert_eq!(h.camera.live_sources.load(Ordering::SeqCst), 0);

        let started = Instant::now();
        h.supervisor.disconnect();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(h.encoder.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_every_successful_connect_is_persisted() {
        let h = harness(false, policy(20));
        h.camera.break_first_stream(3, Duration::ZERO);
        let config = ConnectionConfig::network("192.168.1.10").with_credentials("admin", "pw");
        h.supervisor.connect(config.clone()).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.camera.opens.load(Ordering::SeqCst) == 2
        }));
        h.supervisor.disconnect();

        assert_eq!(h.settings.connection_saves(), 2);
        assert_eq!(h.settings.get_connection_config().unwrap(), Some(config));
    }

    #[test]
    fn test_start_retries_unavailable_camera() {
        let h = harness(false, policy(50));
        h.camera.unavailable_for(Duration::from_millis(120));

        h.supervisor.start(ConnectionConfig::local(0)).unwrap();
        assert_ne!(h.supervisor.state(), ConnectionState::Disconnected);

        assert!(wait_for(Duration::from_secs(5), || {
            h.supervisor.state() == ConnectionState::Streaming
        }));
        assert_eq!(h.camera.opens.load(Ordering::SeqCst), 1);
        assert!(h.camera.attempts.load(Ordering::SeqCst) >= 2);
        h.supervisor.disconnect();
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_cancels_pending_start() {
        let h = harness(false, policy(20));
        h.camera.unavailable_for(Duration::from_secs(3600));
        *h.camera.open_delay.lock().unwrap() = Duration::from_millis(200);

        thread::scope(|s| {
            let starting = s.spawn(|| h.supervisor.start(ConnectionConfig::local(0)));
            assert!(wait_for(Duration::from_secs(5), || {
                h.camera.attempts.load(Ordering::SeqCst) == 1
            }));
            h.supervisor.disconnect();
            let result = starting.join().unwrap();
            assert!(matches!(result, Err(ConnectError::Cancelled)), "{:?}", result);
        });

        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(h.camera.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_preview_receives_frames() {
        let h = harness(false, policy(50));
        let mut preview = h.supervisor.subscribe_preview();
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();

        let mut latest = None;
        assert!(wait_for(Duration::from_secs(5), || {
            latest = preview.try_take();
            latest.is_some()
        }));
        assert_eq!(latest.unwrap().geometry, GEOMETRY);

        h.supervisor.disconnect();
        // The slot is emptied on disconnect
        assert!(preview.try_take().is_none());
    }

    #[test]
    fn test_apply_recording_config_starts_recording() {
        let h = harness(false, policy(50));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            h.supervisor.stats().frames_captured >= 5
        }));
        assert_eq!(h.encoder.opened.load(Ordering::SeqCst), 0);

        let mut config = h.supervisor.recording_config();
        config.enable_record = true;
        h.supervisor.apply_recording_config(config).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            h.supervisor.stats().frames_recorded >= 5
        }));
        assert!(h.settings.get_recording_config().unwrap().enable_record);
        h.supervisor.disconnect();
        assert_eq!(h.encoder.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_apply_recording_config_rejects_invalid_settings() {
        let h = harness(false, policy(50));
        let mut config = h.supervisor.recording_config();
        config.segment_duration_secs = 0;
        assert!(h.supervisor.apply_recording_config(config).is_err());
        assert_eq!(h.supervisor.recording_config().segment_duration_secs, 3600);
    }

    #[test]
    fn test_apply_connection_config_switches_camera() {
        let h = harness(false, policy(50));
        h.supervisor.connect(ConnectionConfig::local(0)).unwrap();
        h.supervisor.apply_connection_config(ConnectionConfig::local(1)).unwrap();

        assert_eq!(h.supervisor.state(), ConnectionState::Streaming);
        assert_eq!(
            *h.camera.last_config.lock().unwrap(),
            Some(ConnectionConfig::local(1))
        );
        assert_eq!(h.camera.live_sources.load(Ordering::SeqCst), 1);
        assert_eq!(h.settings.connection_saves(), 2);
        h.supervisor.disconnect();
    }
}
