//! Video encoding using FFmpeg
//!
//! Raw RGB24 frames are piped directly to an `ffmpeg` child which writes one
//! segment file. The codec is chosen from the configured fourcc.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

use camdvr_capture::{Frame, Geometry};

use crate::config::RecordingConfig;
use crate::error::WriteError;

/// Opens segment writers.
///
/// The codec itself is a pluggable capability; the recorder only relies on
/// this contract.
pub trait Encoder: Send + Sync {
    fn open(
        &self,
        path: &Path,
        geometry: Geometry,
        config: &RecordingConfig,
    ) -> Result<Box<dyn SegmentWriter>, WriteError>;
}

/// One open output file
pub trait SegmentWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), WriteError>;

    /// Flush and close the file
    fn finish(self: Box<Self>) -> Result<(), WriteError>;
}

/// Encoder backed by the ffmpeg binary on PATH
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    pub ffmpeg_bin: String,
    /// qscale for mpeg4/mjpeg (2-31, lower = better)
    pub quality: u32,
    /// CRF for libx264 (18-28 typical)
    pub crf: u32,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            quality: 5,
            crf: 23,
        }
    }
}

impl FfmpegEncoder {
    /// Codec arguments following `-c:v` for a fourcc
    fn codec_args(&self, fourcc: &str) -> Vec<String> {
        let upper = fourcc.trim().to_ascii_uppercase();
        match upper.as_str() {
            "XVID" | "DIVX" | "FMP4" | "MP4V" => vec![
                "mpeg4".into(),
                "-vtag".into(),
                upper.to_ascii_lowercase(),
                "-q:v".into(),
                self.quality.to_string(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ],
            "MJPG" => vec![
                "mjpeg".into(),
                "-q:v".into(),
                self.quality.to_string(),
                "-pix_fmt".into(),
                "yuvj420p".into(),
            ],
            "H264" | "AVC1" | "X264" => vec![
                "libx264".into(),
                "-crf".into(),
                self.crf.to_string(),
                "-preset".into(),
                "fast".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ],
            _ => vec![fourcc.trim().to_ascii_lowercase()],
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn open(
        &self,
        path: &Path,
        geometry: Geometry,
        config: &RecordingConfig,
    ) -> Result<Box<dyn SegmentWriter>, WriteError> {
        info!("starting piped encoding to {:?} ({}, {} fps, {})", path, geometry, config.fps, config.fourcc);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-f").arg("rawvideo")
            .arg("-pix_fmt").arg("rgb24")
            .arg("-s").arg(geometry.to_string())
            .arg("-r").arg(config.fps.to_string())
            .arg("-i").arg("-")
            .arg("-c:v")
            .args(self.codec_args(&config.fourcc))
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("spawning ffmpeg pipe: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| WriteError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WriteError::Spawn {
                    path: path.to_path_buf(),
                    source: std::io::Error::other("failed to open ffmpeg stdin"),
                });
            }
        };

        Ok(Box::new(FfmpegSegment {
            path: path.to_path_buf(),
            geometry,
            child: Some(child),
            stdin: Some(stdin),
        }))
    }
}

struct FfmpegSegment {
    path: PathBuf,
    geometry: Geometry,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl SegmentWriter for FfmpegSegment {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), WriteError> {
        if frame.geometry != self.geometry {
            return Err(WriteError::Write {
                path: self.path.clone(),
                source: std::io::Error::other(format!(
                    "frame is {}, segment is {}",
                    frame.geometry, self.geometry
                )),
            });
        }

        let stdin = self.stdin.as_mut().ok_or_else(|| WriteError::Write {
            path: self.path.clone(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        })?;

        stdin.write_all(&frame.data).map_err(|source| WriteError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn finish(mut self: Box<Self>) -> Result<(), WriteError> {
        // Close stdin to signal EOF to FFmpeg
        self.stdin.take();

        let Some(child) = self.child.take() else {
            return Ok(());
        };

        let output = child.wait_with_output().map_err(|source| WriteError::Write {
            path: self.path.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WriteError::Finish {
                path: self.path.clone(),
                status: output.status.to_string(),
                stderr: stderr.chars().take(500).collect(),
            });
        }

        debug!("closed segment {:?}", self.path);
        Ok(())
    }
}

impl Drop for FfmpegSegment {
    fn drop(&mut self) {
        // Reached only when the segment was abandoned without finish()
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!("failed to reap ffmpeg for {:?}: {}", self.path, e);
            }
        }
    }
}

/// Check if FFmpeg is available
pub fn check_ffmpeg() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
