//! Synthetic capture device (`stub://`).
//!
//! Without a script the device cycles through an empty platen and a steady
//! finger placement, rotating through a few synthetic fingers. Tests drive it
//! with an explicit script of steps.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Duration;

use super::CaptureDevice;
use crate::frame::{PixelFormat, RawImage};

const BLANK_LEVEL: u8 = 255;
const CYCLE_BLANK_FRAMES: u64 = 20;
const CYCLE_FINGER_FRAMES: u64 = 30;
const CYCLE_FINGERS: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticStep {
    /// Empty platen.
    Blank,
    /// A steady placement of synthetic finger `seed`.
    Finger(u8),
    /// The read times out.
    Timeout,
    /// The read fails with an I/O error.
    Fail,
}

pub struct SyntheticDevice {
    name: String,
    width: u32,
    height: u32,
    script: Option<VecDeque<SyntheticStep>>,
    open_failures: u32,
    open: bool,
    frame_count: u64,
}

impl SyntheticDevice {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            script: None,
            open_failures: 0,
            open: false,
            frame_count: 0,
        }
    }

    /// A device that plays `steps` once, then times out forever.
    pub fn scripted(name: &str, width: u32, height: u32, steps: Vec<SyntheticStep>) -> Self {
        Self {
            script: Some(steps.into()),
            ..Self::new(name, width, height)
        }
    }

    /// Fail the next `count` open attempts.
    pub fn with_open_failures(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    fn next_step(&mut self) -> SyntheticStep {
        match self.script.as_mut() {
            Some(script) => script.pop_front().unwrap_or(SyntheticStep::Timeout),
            None => {
                let cycle = CYCLE_BLANK_FRAMES + CYCLE_FINGER_FRAMES;
                let position = self.frame_count % cycle;
                if position < CYCLE_BLANK_FRAMES {
                    SyntheticStep::Blank
                } else {
                    let finger = (self.frame_count / cycle) % CYCLE_FINGERS;
                    SyntheticStep::Finger(finger as u8 + 1)
                }
            }
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(anyhow!("synthetic device {} unavailable", self.name));
        }
        self.open = true;
        log::info!("SyntheticDevice: connected to {} (synthetic)", self.name);
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, _timeout: Duration) -> Result<Option<RawImage>> {
        if !self.open {
            return Err(anyhow!("synthetic device {} not open", self.name));
        }
        let step = self.next_step();
        self.frame_count += 1;
        let pixels = match step {
            SyntheticStep::Blank => vec![BLANK_LEVEL; (self.width * self.height) as usize],
            SyntheticStep::Finger(seed) => synthetic_fingerprint(self.width, self.height, seed),
            SyntheticStep::Timeout => return Ok(None),
            SyntheticStep::Fail => return Err(anyhow!("synthetic read failure on {}", self.name)),
        };
        Ok(Some(RawImage {
            pixels,
            width: self.width,
            height: self.height,
            format: PixelFormat::Grey,
        }))
    }
}

/// Deterministic ridge pattern inside an elliptical contact area on a white background.
///
/// Different seeds change ridge orientation and period, so their point samples
/// disagree while the same seed always renders identical pixels.
pub fn synthetic_fingerprint(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let angle = (seed as f32) * 0.7;
    let period = 3.0 + (seed % 5) as f32 * 1.3;
    let (sin_a, cos_a) = angle.sin_cos();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let rx = width as f32 * 0.4;
    let ry = height as f32 * 0.45;

    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            if dx * dx + dy * dy > 1.0 {
                pixels.push(BLANK_LEVEL);
                continue;
            }
            let u = x as f32 * cos_a + y as f32 * sin_a;
            let v = (u / period + seed as f32).sin();
            pixels.push((110.0 + 90.0 * v).round().clamp(0.0, 254.0) as u8);
        }
    }
    pixels
}
