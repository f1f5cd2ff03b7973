//! FFmpeg-backed Frame Source
//!
//! Geometry is probed with `ffprobe`, then an `ffmpeg` child decodes the
//! camera into packed RGB24 frames on its stdout.

use bytes::BytesMut;
use chrono::Utc;
use std::io::{BufReader, ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::CaptureError;
use crate::frame::{Frame, Geometry};
use crate::source::{FrameSource, Interrupter, SourceOpener};

/// Opens cameras through the ffmpeg/ffprobe binaries on PATH
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// Socket I/O timeout for network streams; a stalled stream ends the read
    pub network_timeout: Duration,
    /// Force RTSP over TCP (fewer artefacts than UDP on lossy links)
    pub rtsp_over_tcp: bool,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            network_timeout: Duration::from_secs(5),
            rtsp_over_tcp: true,
        }
    }
}

impl FfmpegOpener {
    /// Input options placed before `-i`
    fn input_args(&self, config: &ConnectionConfig) -> Vec<String> {
        let mut args = Vec::new();
        let url = config.source_url();

        if config.is_local() {
            args.push("-f".to_string());
            args.push(if cfg!(target_os = "macos") { "avfoundation" } else { "v4l2" }.to_string());
        } else if url.starts_with("rtsp://") {
            if self.rtsp_over_tcp {
                args.push("-rtsp_transport".to_string());
                args.push("tcp".to_string());
            }
            args.push("-timeout".to_string());
            args.push(self.network_timeout.as_micros().to_string());
        } else {
            args.push("-rw_timeout".to_string());
            args.push(self.network_timeout.as_micros().to_string());
        }

        args.push("-i".to_string());
        args.push(url);
        args
    }

    fn probe_geometry(&self, config: &ConnectionConfig) -> Result<Geometry, CaptureError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v").arg("error")
            .args(self.input_args(config))
            .arg("-select_streams").arg("v:0")
            .arg("-show_entries").arg("stream=width,height")
            .arg("-of").arg("csv=s=x:p=0")
            .stdin(Stdio::null());

        debug!("probing {}", config);

        let output = cmd.output().map_err(|source| CaptureError::Spawn {
            program: self.ffprobe_bin.clone(),
            source,
        })?;

        if !output.status.success() {
            // ffprobe echoes the input URL, credentials included
            let stderr = config.scrub(&String::from_utf8_lossy(&output.stderr));
            return Err(CaptureError::Open {
                target: config.to_string(),
                reason: stderr.trim().chars().take(300).collect(),
            });
        }

        parse_geometry(&String::from_utf8_lossy(&output.stdout))
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        let geometry = self.probe_geometry(config)?;

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-nostdin")
            .args(self.input_args(config));

        if config.mirror {
            cmd.arg("-vf").arg("hflip");
        }

        cmd.arg("-an")
            .arg("-f").arg("rawvideo")
            .arg("-pix_fmt").arg("rgb24")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // Nobody drains stderr while streaming, so it must not be a pipe
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|source| CaptureError::Spawn {
            program: self.ffmpeg_bin.clone(),
            source,
        })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Open {
                    target: config.to_string(),
                    reason: "failed to open ffmpeg stdout".to_string(),
                });
            }
        };

        info!("opened {} ({})", config, geometry);

        Ok(Box::new(FfmpegSource {
            geometry,
            reader: BufReader::with_capacity(geometry.frame_len().max(64 * 1024), stdout),
            child: Arc::new(Mutex::new(child)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A running ffmpeg decode of one camera
pub struct FfmpegSource {
    geometry: Geometry,
    reader: BufReader<ChildStdout>,
    child: Arc<Mutex<Child>>,
    interrupted: Arc<AtomicBool>,
}

impl FrameSource for FfmpegSource {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut buf = BytesMut::zeroed(self.geometry.frame_len());

        match self.reader.read_exact(&mut buf[..]) {
            Ok(()) => Frame::new(buf.freeze(), self.geometry, Utc::now()),
            Err(_) if self.interrupted.load(Ordering::SeqCst) => Err(CaptureError::Interrupted),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(e) => Err(CaptureError::Io(e)),
        }
    }

    fn interrupter(&self) -> Interrupter {
        let child = self.child.clone();
        let interrupted = self.interrupted.clone();
        Interrupter::new(move || {
            interrupted.store(true, Ordering::SeqCst);
            // Killing ffmpeg closes its stdout, which ends the blocked read
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        })
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                if e.kind() != ErrorKind::InvalidInput {
                    warn!("failed to stop ffmpeg source: {}", e);
                }
            }
            let _ = child.wait();
        }
        debug!("released ffmpeg source ({})", self.geometry);
    }
}

fn parse_geometry(output: &str) -> Result<Geometry, CaptureError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CaptureError::Probe("no video stream reported".to_string()))?;

    let (w, h) = line
        .split_once('x')
        .ok_or_else(|| CaptureError::Probe(format!("unexpected probe output: {}", line)))?;

    let width = w.trim().parse::<u32>().map_err(|_| CaptureError::Probe(format!("bad width: {}", w)))?;
    let height = h
        .trim()
        .trim_end_matches('x')
        .parse::<u32>()
        .map_err(|_| CaptureError::Probe(format!("bad height: {}", h)))?;

    if width == 0 || height == 0 {
        return Err(CaptureError::Probe(format!("empty geometry {}x{}", width, height)));
    }

    Ok(Geometry::new(width, height))
}

/// Check if ffprobe is available
pub fn check_ffprobe() -> bool {
    Command::new("ffprobe")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
