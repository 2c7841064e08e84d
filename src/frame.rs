//! Fingerprint frames.
//!
//! - `RawImage`: a full device image in its native pixel format.
//! - `Frame`: an 8-bit grayscale crop of the calibration ROI, tagged with a
//!   monotonic capture instant.
//!
//! Frames hold biometric pixel data. They are not `Clone`, are never logged or
//! serialized, and their pixels are zeroized on drop.

use anyhow::{anyhow, Result};
use std::time::Instant;
use zeroize::Zeroize;

use crate::CalibrationRoi;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Grey,
    Rgb24,
    Yuyv,
}

/// A full image as delivered by a capture device.
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Drop for RawImage {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

impl RawImage {
    /// Convert to grayscale, then crop to `roi`. Falls back to the full image when
    /// the ROI does not fit.
    pub fn into_frame(self, roi: &CalibrationRoi, captured_at: Instant) -> Result<Frame> {
        let gray = to_gray(&self.pixels, self.width, self.height, self.format)?;
        if !roi.fits(self.width, self.height) {
            log::warn!(
                "invalid roi bounds ({},{},{},{}) for frame {}x{}; using full frame",
                roi.x,
                roi.y,
                roi.width,
                roi.height,
                self.width,
                self.height
            );
            return Ok(Frame::new(gray, self.width, self.height, captured_at));
        }
        let mut cropped = Vec::with_capacity((roi.width * roi.height) as usize);
        let stride = self.width as usize;
        for row in roi.y..roi.y + roi.height {
            let start = row as usize * stride + roi.x as usize;
            cropped.extend_from_slice(&gray[start..start + roi.width as usize]);
        }
        let mut gray = gray;
        gray.zeroize();
        Ok(Frame::new(cropped, roi.width, roi.height, captured_at))
    }
}

fn to_gray(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    let count = width
        .checked_mul(height)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))? as usize;
    match format {
        PixelFormat::Grey => {
            if pixels.len() != count {
                return Err(anyhow!(
                    "GREY frame length mismatch: expected {}, got {}",
                    count,
                    pixels.len()
                ));
            }
            Ok(pixels.to_vec())
        }
        PixelFormat::Rgb24 => {
            let expected = count
                .checked_mul(3)
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            Ok(pixels
                .chunks_exact(3)
                .map(|px| {
                    let luma =
                        0.299_f32 * px[0] as f32 + 0.587_f32 * px[1] as f32 + 0.114_f32 * px[2] as f32;
                    luma.round().clamp(0.0, 255.0) as u8
                })
                .collect())
        }
        PixelFormat::Yuyv => {
            let expected = count
                .checked_mul(2)
                .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "YUYV frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            // Y0 U Y1 V: luma is every even byte.
            Ok(pixels.iter().step_by(2).copied().collect())
        }
    }
}

/// Grayscale fingerprint frame. Explicitly NOT `Clone`.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, captured_at: Instant) -> Self {
        Self {
            pixels,
            width,
            height,
            captured_at,
        }
    }

    /// Grayscale pixels, row-major. Only capability backends should read these.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn same_shape(&self, other_width: u32, other_height: u32) -> bool {
        self.width == other_width && self.height == other_height
    }

    pub fn intensity_stats(&self) -> IntensityStats {
        intensity_stats(&self.pixels)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityStats {
    pub mean: f32,
    pub stddev: f32,
}

pub fn intensity_stats(pixels: &[u8]) -> IntensityStats {
    if pixels.is_empty() {
        return IntensityStats {
            mean: 0.0,
            stddev: 0.0,
        };
    }
    let n = pixels.len() as f64;
    let sum: f64 = pixels.iter().map(|&p| p as f64).sum();
    let mean = sum / n;
    let var: f64 = pixels
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    IntensityStats {
        mean: mean as f32,
        stddev: var.sqrt() as f32,
    }
}

/// Mean absolute per-pixel delta normalized to 0..1. Mismatched lengths count as fully different.
pub fn normalized_difference(a: &[u8], b: &[u8]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (x as i16 - y as i16).unsigned_abs() as u64)
        .sum();
    (total as f64 / (a.len() as f64 * 255.0)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_is_converted_to_luma() -> Result<()> {
        let image = RawImage {
            pixels: vec![255, 255, 255, 0, 0, 0],
            width: 2,
            height: 1,
            format: PixelFormat::Rgb24,
        };
        let roi = CalibrationRoi::new(0, 0, 2, 1)?;
        let frame = image.into_frame(&roi, Instant::now())?;
        assert_eq!(frame.pixels(), &[255, 0]);
        Ok(())
    }

    #[test]
    fn yuyv_keeps_luma_bytes() -> Result<()> {
        let gray = to_gray(&[10, 128, 20, 128], 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(gray, vec![10, 20]);
        Ok(())
    }

    #[test]
    fn crop_extracts_roi_rows() -> Result<()> {
        // 4x3 image with pixel value = index
        let image = RawImage {
            pixels: (0u8..12).collect(),
            width: 4,
            height: 3,
            format: PixelFormat::Grey,
        };
        let roi = CalibrationRoi::new(1, 1, 2, 2)?;
        let frame = image.into_frame(&roi, Instant::now())?;
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.pixels(), &[5, 6, 9, 10]);
        Ok(())
    }

    #[test]
    fn oversized_roi_falls_back_to_full_frame() -> Result<()> {
        let image = RawImage {
            pixels: vec![7u8; 16],
            width: 4,
            height: 4,
            format: PixelFormat::Grey,
        };
        let roi = CalibrationRoi::new(2, 2, 10, 10)?;
        let frame = image.into_frame(&roi, Instant::now())?;
        assert_eq!((frame.width, frame.height), (4, 4));
        Ok(())
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(to_gray(&[1, 2, 3], 2, 1, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn difference_is_normalized() {
        assert_eq!(normalized_difference(&[0, 0], &[0, 0]), 0.0);
        assert_eq!(normalized_difference(&[0, 0], &[255, 255]), 1.0);
        assert!((normalized_difference(&[0, 100], &[0, 151]) - 0.1).abs() < 1e-6);
        assert_eq!(normalized_difference(&[0], &[0, 0]), 1.0);
    }

    #[test]
    fn stats_of_uniform_image_have_zero_spread() {
        let stats = intensity_stats(&[200; 64]);
        assert_eq!(stats.mean, 200.0);
        assert_eq!(stats.stddev, 0.0);
    }
}
