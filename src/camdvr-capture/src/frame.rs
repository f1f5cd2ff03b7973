//! Captured frame data

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use std::fmt;
use std::path::Path;

use crate::error::CaptureError;

/// Bytes per pixel of the packed RGB24 layout every source produces
pub const BYTES_PER_PIXEL: usize = 3;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size in bytes of one RGB24 frame with this geometry
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded camera frame.
///
/// The pixel buffer is reference counted and read-only, so cloning a frame to
/// hand it to several consumers never copies pixels.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,
    pub geometry: Geometry,
    pub timestamp: DateTime<Utc>,
    /// Position in capture order, assigned by the capture loop
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        geometry: Geometry,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CaptureError> {
        let data = data.into();
        if data.len() != geometry.frame_len() {
            return Err(CaptureError::FrameSize {
                expected: geometry.frame_len(),
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            geometry,
            timestamp,
            sequence: 0,
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Convert to an RGB image buffer
    pub fn to_image(&self) -> Result<RgbImage, CaptureError> {
        RgbImage::from_raw(self.width(), self.height(), self.data.to_vec()).ok_or(
            CaptureError::FrameSize {
                expected: self.geometry.frame_len(),
                actual: self.data.len(),
            },
        )
    }

    /// Save as an image file; the format follows the extension
    pub fn save_image(&self, path: impl AsRef<Path>) -> Result<(), CaptureError> {
        self.to_image()?.save(path)?;
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_buffer_size() {
        let geometry = Geometry::new(4, 2);
        let err = Frame::new(vec![0u8; 10], geometry, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FrameSize { expected: 24, actual: 10 }
        ));
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = Frame::new(vec![7u8; 12], Geometry::new(2, 2), Utc::now()).unwrap();
        let copy = frame.clone().with_sequence(5);
        assert_eq!(frame.data.as_ptr(), copy.data.as_ptr());
        assert_eq!(copy.sequence, 5);
        assert_eq!(frame.sequence, 0);
    }

    #[test]
    fn test_save_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.png");
        let frame = Frame::new(vec![128u8; 4 * 3 * 3], Geometry::new(4, 3), Utc::now()).unwrap();
        frame.save_image(&path).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
    }
}
