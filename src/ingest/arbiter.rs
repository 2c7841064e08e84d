use anyhow::{anyhow, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::CalibrationRoi;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraMode {
    /// The capture pipeline may pull frames and trigger punches.
    Punch,
    /// An enrollment session owns the camera; automatic punching is suspended.
    Enrollment,
}

/// Exclusive owner of the camera. The capture pipeline borrows it one pull at a
/// time; an enrollment session holds it for its whole duration.
pub struct CameraArbiter {
    source: Mutex<FrameSource>,
    enrollment_active: AtomicBool,
    /// Calibration waiting for the next camera hand-out; never blocks on `source`.
    pending_roi: Mutex<Option<CalibrationRoi>>,
    last_stats: Mutex<SourceStats>,
}

impl CameraArbiter {
    pub fn new(source: FrameSource) -> Self {
        Self {
            source: Mutex::new(source),
            enrollment_active: AtomicBool::new(false),
            pending_roi: Mutex::new(None),
            last_stats: Mutex::new(SourceStats::default()),
        }
    }

    pub fn mode(&self) -> CameraMode {
        if self.enrollment_active.load(Ordering::SeqCst) {
            CameraMode::Enrollment
        } else {
            CameraMode::Punch
        }
    }

    /// Borrow the camera for one capture-pipeline pull. `None` while enrollment owns it.
    pub fn try_capture(&self) -> Result<Option<MutexGuard<'_, FrameSource>>> {
        if self.enrollment_active.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut guard = self
            .source
            .lock()
            .map_err(|_| anyhow!("camera lock poisoned"))?;
        // Re-check: enrollment may have claimed the camera while we waited.
        if self.enrollment_active.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.apply_pending_roi(&mut guard);
        Ok(Some(guard))
    }

    /// Take the camera for an enrollment session, waiting up to `wait` for the
    /// capture pipeline to finish its current pull.
    pub fn acquire_for_enrollment(&self, wait: Duration) -> Result<EnrollmentCamera<'_>> {
        if self
            .enrollment_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("camera already in use by another enrollment"));
        }
        let deadline = Instant::now() + wait;
        loop {
            match self.source.try_lock() {
                Ok(mut guard) => {
                    self.apply_pending_roi(&mut guard);
                    log::info!("camera switched to enrollment mode");
                    return Ok(EnrollmentCamera {
                        guard,
                        flag: &self.enrollment_active,
                    });
                }
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(TryLockError::WouldBlock) => {
                    self.enrollment_active.store(false, Ordering::SeqCst);
                    return Err(anyhow!("timed out waiting for camera"));
                }
                Err(TryLockError::Poisoned(_)) => {
                    self.enrollment_active.store(false, Ordering::SeqCst);
                    return Err(anyhow!("camera lock poisoned"));
                }
            }
        }
    }

    /// Explicit recalibration: replace the ROI used for all subsequent captures.
    ///
    /// Applied immediately when the camera is idle, otherwise at the next
    /// hand-out (the next pipeline pull, or after the running enrollment
    /// session). Returns whether it was applied immediately.
    pub fn recalibrate(&self, roi: CalibrationRoi) -> Result<bool> {
        *self
            .pending_roi
            .lock()
            .map_err(|_| anyhow!("calibration lock poisoned"))? = Some(roi);
        match self.source.try_lock() {
            Ok(mut source) => {
                self.apply_pending_roi(&mut source);
                Ok(true)
            }
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Poisoned(_)) => Err(anyhow!("camera lock poisoned")),
        }
    }

    fn apply_pending_roi(&self, source: &mut FrameSource) {
        let pending = match self.pending_roi.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };
        if let Some(roi) = pending {
            source.set_roi(roi);
            log::info!("camera roi set to {:?}", roi);
        }
    }

    /// Current source stats, or the last ones seen while the camera is busy.
    pub fn stats(&self) -> Result<SourceStats> {
        let mut last = self
            .last_stats
            .lock()
            .map_err(|_| anyhow!("camera stats lock poisoned"))?;
        if let Some(stats) = self.try_with_source(|s| s.stats())? {
            *last = stats;
        }
        Ok(last.clone())
    }

    /// Run `f` on the source only if nobody holds the camera right now.
    pub fn try_with_source<T>(&self, f: impl FnOnce(&mut FrameSource) -> T) -> Result<Option<T>> {
        match self.source.try_lock() {
            Ok(mut source) => Ok(Some(f(&mut source))),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(_)) => Err(anyhow!("camera lock poisoned")),
        }
    }

    pub fn with_source<T>(&self, f: impl FnOnce(&mut FrameSource) -> T) -> Result<T> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| anyhow!("camera lock poisoned"))?;
        Ok(f(&mut source))
    }
}

/// Camera ownership for an enrollment session. Dropping it returns the camera to punch mode.
pub struct EnrollmentCamera<'a> {
    guard: MutexGuard<'a, FrameSource>,
    flag: &'a AtomicBool,
}

impl Deref for EnrollmentCamera<'_> {
    type Target = FrameSource;

    fn deref(&self) -> &FrameSource {
        &self.guard
    }
}

impl DerefMut for EnrollmentCamera<'_> {
    fn deref_mut(&mut self) -> &mut FrameSource {
        &mut self.guard
    }
}

impl Drop for EnrollmentCamera<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        log::info!("camera returned to punch mode");
    }
}
