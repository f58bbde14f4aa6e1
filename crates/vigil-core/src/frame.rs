//! Grayscale frame type and frame sources.

use crate::types::BoundingBox;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// A grayscale video frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    /// Monotonic capture time, used for cooldowns.
    pub timestamp: Instant,
    /// Wall-clock capture time, written into feature samples.
    pub captured_at: DateTime<Utc>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap raw grayscale bytes captured now.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            timestamp: Instant::now(),
            captured_at: Utc::now(),
        })
    }

    /// Decode an image file (any format `image` understands) into a grayscale frame.
    pub fn from_path(path: &Path) -> Result<Self, FrameError> {
        let img = image::open(path)
            .map_err(|e| FrameError::Decode(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (w, h) = img.dimensions();
        Self::new(img.into_raw(), w, h, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Capture time as fractional seconds since the Unix epoch.
    pub fn epoch_seconds(&self) -> f64 {
        self.captured_at.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Copy out the region under `bbox`, grown by `padding` and clipped to the frame.
    ///
    /// Returns `None` when the clipped region is empty.
    pub fn crop(&self, bbox: &BoundingBox, padding: u32) -> Option<Frame> {
        let (x0, y0, x1, y1) = bbox.padded_pixels(padding, self.width, self.height);
        let (w, h) = (x1 - x0, y1 - y0);
        if w == 0 || h == 0 {
            return None;
        }

        let stride = self.width as usize;
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y1 {
            let start = y as usize * stride + x0 as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }

        Some(Frame {
            data,
            width: w,
            height: h,
            sequence: self.sequence,
            timestamp: self.timestamp,
            captured_at: self.captured_at,
        })
    }

    /// Same frame metadata, new pixels.
    pub fn with_pixels(&self, data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            sequence: self.sequence,
            timestamp: self.timestamp,
            captured_at: self.captured_at,
        }
    }

    /// Convert into an `image` buffer for encoding.
    pub fn to_gray_image(&self) -> Option<image::GrayImage> {
        image::GrayImage::from_raw(self.width, self.height, self.data.clone())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// Failure of the frame source itself. Fatal to the perception loop.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream disconnected: {0}")]
    Disconnected(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// A producer of video frames.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError>;
}

impl<I> FrameSource for I
where
    I: Iterator<Item = Frame>,
{
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        Ok(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> Frame {
        let data = (0..w * h).map(|i| (i % 256) as u8).collect();
        Frame::new(data, w, h, 7).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_length() {
        assert!(Frame::new(vec![0; 10], 4, 4, 0).is_err());
    }

    #[test]
    fn test_crop_with_padding() {
        let f = gradient(10, 10);
        let c = f.crop(&BoundingBox::new(4.0, 4.0, 2.0, 2.0), 1).unwrap();
        assert_eq!((c.width, c.height), (4, 4));
        assert_eq!(c.data[0], f.data[3 * 10 + 3]);
        assert_eq!(c.sequence, 7);
    }

    #[test]
    fn test_crop_outside_is_none() {
        let f = gradient(10, 10);
        assert!(f.crop(&BoundingBox::new(50.0, 50.0, 5.0, 5.0), 0).is_none());
    }

    #[test]
    fn test_iterator_source_ends() {
        let mut src = vec![gradient(2, 2)].into_iter();
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_from_path_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.png");
        image::GrayImage::from_raw(3, 2, vec![1, 2, 3, 4, 5, 6])
            .unwrap()
            .save(&path)
            .unwrap();
        let f = Frame::from_path(&path).unwrap();
        assert_eq!((f.width, f.height), (3, 2));
        assert_eq!(f.data, vec![1, 2, 3, 4, 5, 6]);
    }
}
