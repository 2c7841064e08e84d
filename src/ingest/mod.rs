//! Frame acquisition.
//!
//! This module provides the capture devices and the `FrameSource` that turns
//! them into a paced stream of cropped grayscale frames:
//! - USB/V4L2 devices (feature: camera-v4l2)
//! - Synthetic `stub://` devices (tests, demos)
//!
//! `FrameSource` never terminates and never blocks past its read timeout.
//! Device failures become `CaptureEvent::Failure` markers and timeouts become
//! `CaptureEvent::NoFrame`; the consumer decides whether to reconnect.
//!
//! The ingestion layer MUST NOT:
//! - Store raw frames to disk
//! - Log pixel content

mod arbiter;
pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::CameraSettings;
use crate::frame::{Frame, RawImage};
use crate::CalibrationRoi;

pub use arbiter::{CameraArbiter, CameraMode, EnrollmentCamera};
pub use synthetic::{SyntheticDevice, SyntheticStep};
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Device;

/// A camera that yields full images. Implementations own the device handle.
pub trait CaptureDevice: Send {
    /// Device identifier (path or stub URI).
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Read the next image, waiting at most `timeout`. `Ok(None)` means the wait timed out.
    fn read(&mut self, timeout: Duration) -> Result<Option<RawImage>>;
}

/// One pull from a `FrameSource`.
pub enum CaptureEvent {
    Frame(Frame),
    /// The read timed out; no frame this tick.
    NoFrame,
    /// The device could not be opened or failed mid-stream.
    Failure(String),
}

#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Minimum spacing between pulls.
    pub interval: Duration,
    pub read_timeout: Duration,
    /// Consecutive timeouts after which the device is reported unhealthy.
    pub unhealthy_after_timeouts: u32,
}

impl SourceSettings {
    pub fn from_camera(camera: &CameraSettings) -> Self {
        Self {
            interval: Duration::from_millis(1000 / camera.fps.max(1) as u64),
            read_timeout: camera.read_timeout,
            unhealthy_after_timeouts: camera.unhealthy_after_timeouts,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SourceStats {
    pub device: String,
    pub frames_captured: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub healthy: bool,
}

/// Result of a one-shot camera check.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CameraDiagnostics {
    pub device: String,
    pub accessible: bool,
    pub opened: bool,
    pub frame_captured: bool,
    pub roi_valid: bool,
    pub resolution: Option<String>,
    pub error: Option<String>,
}

/// Paced, restartable source of ROI frames. Iterating it never ends.
pub struct FrameSource {
    device: Box<dyn CaptureDevice>,
    roi: CalibrationRoi,
    settings: SourceSettings,
    last_pull: Option<Instant>,
    consecutive_timeouts: u32,
    healthy: bool,
    stats: SourceStats,
}

impl FrameSource {
    pub fn new(device: Box<dyn CaptureDevice>, roi: CalibrationRoi, settings: SourceSettings) -> Self {
        let stats = SourceStats {
            device: device.name().to_string(),
            healthy: true,
            ..SourceStats::default()
        };
        Self {
            device,
            roi,
            settings,
            last_pull: None,
            consecutive_timeouts: 0,
            healthy: true,
            stats,
        }
    }

    /// Build a source for the configured device path. `stub://` paths use the synthetic device.
    pub fn from_config(camera: &CameraSettings, roi: CalibrationRoi) -> Result<Self> {
        let device = open_device(camera)?;
        Ok(Self::new(device, roi, SourceSettings::from_camera(camera)))
    }

    pub fn roi(&self) -> CalibrationRoi {
        self.roi
    }

    /// Replace the ROI. Only the explicit recalibration path calls this.
    pub fn set_roi(&mut self, roi: CalibrationRoi) {
        log::info!(
            "roi updated: ({}, {}, {}, {})",
            roi.x,
            roi.y,
            roi.width,
            roi.height
        );
        self.roi = roi;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            healthy: self.healthy,
            ..self.stats.clone()
        }
    }

    /// Close and reopen the device.
    pub fn restart(&mut self) -> Result<()> {
        self.device.close();
        self.consecutive_timeouts = 0;
        match self.device.open() {
            Ok(()) => {
                self.healthy = true;
                log::info!("camera {} reopened", self.device.name());
                Ok(())
            }
            Err(err) => {
                self.healthy = false;
                self.stats.failures += 1;
                Err(err)
            }
        }
    }

    /// Pull one event, pacing to the configured interval.
    pub fn pull(&mut self) -> CaptureEvent {
        if let Some(last) = self.last_pull {
            let elapsed = last.elapsed();
            if elapsed < self.settings.interval {
                std::thread::sleep(self.settings.interval - elapsed);
            }
        }
        self.last_pull = Some(Instant::now());

        if !self.device.is_open() {
            if let Err(err) = self.device.open() {
                self.mark_failure();
                return CaptureEvent::Failure(format!(
                    "failed to open camera {}: {}",
                    self.device.name(),
                    err
                ));
            }
            log::info!("camera {} opened", self.device.name());
        }

        match self.device.read(self.settings.read_timeout) {
            Ok(Some(image)) => {
                let captured_at = Instant::now();
                match image.into_frame(&self.roi, captured_at) {
                    Ok(frame) => {
                        if !self.healthy {
                            log::info!("camera {} healthy again", self.device.name());
                        }
                        self.consecutive_timeouts = 0;
                        self.healthy = true;
                        self.stats.frames_captured += 1;
                        CaptureEvent::Frame(frame)
                    }
                    Err(err) => {
                        self.mark_failure();
                        CaptureEvent::Failure(format!("unusable frame: {}", err))
                    }
                }
            }
            Ok(None) => {
                self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
                self.stats.timeouts += 1;
                if self.consecutive_timeouts >= self.settings.unhealthy_after_timeouts
                    && self.healthy
                {
                    log::warn!(
                        "camera {} unhealthy after {} consecutive timeouts",
                        self.device.name(),
                        self.consecutive_timeouts
                    );
                    self.healthy = false;
                }
                CaptureEvent::NoFrame
            }
            Err(err) => {
                self.device.close();
                self.mark_failure();
                CaptureEvent::Failure(format!(
                    "camera {} read failed: {}",
                    self.device.name(),
                    err
                ))
            }
        }
    }

    fn mark_failure(&mut self) {
        self.stats.failures += 1;
        self.healthy = false;
    }

    /// Open the device, grab one image and check the ROI against it. The device is closed afterwards.
    pub fn camera_test(&mut self) -> CameraDiagnostics {
        let name = self.device.name().to_string();
        let mut result = CameraDiagnostics {
            device: name.clone(),
            ..CameraDiagnostics::default()
        };
        if !name.starts_with("stub://") && !Path::new(&name).exists() {
            result.error = Some(format!("device not found: {}", name));
            return result;
        }
        result.accessible = true;

        self.device.close();
        if let Err(err) = self.device.open() {
            result.error = Some(format!("failed to open camera: {}", err));
            return result;
        }
        result.opened = true;

        match self.device.read(self.settings.read_timeout) {
            Ok(Some(image)) => {
                result.frame_captured = true;
                result.resolution = Some(format!("{}x{}", image.width, image.height));
                if self.roi.fits(image.width, image.height) {
                    result.roi_valid = true;
                } else {
                    result.error = Some(format!(
                        "roi out of bounds: ({},{},{},{}) for {}x{}",
                        self.roi.x,
                        self.roi.y,
                        self.roi.width,
                        self.roi.height,
                        image.width,
                        image.height
                    ));
                }
            }
            Ok(None) => result.error = Some("timed out waiting for a frame".to_string()),
            Err(err) => result.error = Some(format!("failed to capture frame: {}", err)),
        }
        self.device.close();
        result
    }
}

impl Iterator for FrameSource {
    type Item = CaptureEvent;

    fn next(&mut self) -> Option<CaptureEvent> {
        Some(self.pull())
    }
}

fn open_device(camera: &CameraSettings) -> Result<Box<dyn CaptureDevice>> {
    if camera.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevice::new(
            &camera.device,
            camera.width,
            camera.height,
        )));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        Ok(Box::new(V4l2Device::new(
            &camera.device,
            camera.width,
            camera.height,
            camera.fps,
        )))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(anyhow!(
            "camera {} requires the camera-v4l2 feature",
            camera.device
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SourceSettings {
        SourceSettings {
            interval: Duration::ZERO,
            read_timeout: Duration::from_millis(10),
            unhealthy_after_timeouts: 3,
        }
    }

    fn roi() -> CalibrationRoi {
        CalibrationRoi {
            x: 0,
            y: 0,
            width: 32,
            height: 32,
        }
    }

    #[test]
    fn source_yields_cropped_frames() {
        let device = SyntheticDevice::scripted(
            "stub://test",
            64,
            48,
            vec![SyntheticStep::Finger(1)],
        );
        let mut source = FrameSource::new(Box::new(device), roi(), settings());
        match source.pull() {
            CaptureEvent::Frame(frame) => assert_eq!((frame.width, frame.height), (32, 32)),
            _ => panic!("expected a frame"),
        }
        assert_eq!(source.stats().frames_captured, 1);
    }

    #[test]
    fn consecutive_timeouts_mark_unhealthy() {
        let device = SyntheticDevice::scripted(
            "stub://test",
            64,
            48,
            vec![
                SyntheticStep::Timeout,
                SyntheticStep::Timeout,
                SyntheticStep::Timeout,
                SyntheticStep::Blank,
            ],
        );
        let mut source = FrameSource::new(Box::new(device), roi(), settings());
        assert!(matches!(source.pull(), CaptureEvent::NoFrame));
        assert!(matches!(source.pull(), CaptureEvent::NoFrame));
        assert!(source.is_healthy());
        assert!(matches!(source.pull(), CaptureEvent::NoFrame));
        assert!(!source.is_healthy());
        assert!(matches!(source.pull(), CaptureEvent::Frame(_)));
        assert!(source.is_healthy());
    }

    #[test]
    fn read_errors_become_failure_markers_and_stream_continues() {
        let device = SyntheticDevice::scripted(
            "stub://test",
            64,
            48,
            vec![SyntheticStep::Fail, SyntheticStep::Finger(2)],
        );
        let mut source = FrameSource::new(Box::new(device), roi(), settings());
        let events: Vec<CaptureEvent> = source.by_ref().take(2).collect();
        assert!(matches!(events[0], CaptureEvent::Failure(_)));
        assert!(matches!(events[1], CaptureEvent::Frame(_)));
    }

    #[test]
    fn open_failures_are_reported_not_fatal() {
        let device = SyntheticDevice::scripted("stub://test", 64, 48, vec![SyntheticStep::Blank])
            .with_open_failures(1);
        let mut source = FrameSource::new(Box::new(device), roi(), settings());
        assert!(matches!(source.pull(), CaptureEvent::Failure(_)));
        assert!(!source.is_healthy());
        assert!(matches!(source.pull(), CaptureEvent::Frame(_)));
    }

    #[test]
    fn camera_test_reports_roi_outside_frame() {
        let device = SyntheticDevice::new("stub://diag", 64, 48);
        let mut source = FrameSource::new(
            Box::new(device),
            CalibrationRoi {
                x: 40,
                y: 0,
                width: 32,
                height: 32,
            },
            settings(),
        );
        let diag = source.camera_test();
        assert!(diag.opened);
        assert!(diag.frame_captured);
        assert_eq!(diag.resolution.as_deref(), Some("64x48"));
        assert!(!diag.roi_valid);
        assert!(diag.error.is_some());
    }
}
