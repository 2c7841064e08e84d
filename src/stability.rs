//! Finger presence detection.
//!
//! A presence event fires when `stable_frames` consecutive frames each differ
//! from their predecessor by less than `difference_threshold` and the frames
//! are not an empty platen. After an event the detector stays quiet for
//! `cooldown` so one placement triggers once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::config::AutopunchSettings;
use crate::frame::{normalized_difference, Frame};

/// Mean intensity within this distance of 0 or 255 counts as an empty platen.
pub const DEFAULT_BLANK_LEVEL: f32 = 12.0;
/// Below this intensity spread a frame has no ridge texture.
pub const DEFAULT_BLANK_STDDEV: f32 = 4.0;

/// Process-wide auto-punch toggle, shared by the pipeline and the control API.
#[derive(Clone, Debug)]
pub struct AutoPunchSwitch(Arc<AtomicBool>);

impl AutoPunchSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        let previous = self.0.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            log::info!("auto-punch {}", if enabled { "enabled" } else { "disabled" });
        }
    }
}

#[derive(Clone, Debug)]
pub struct StabilitySettings {
    pub stable_frames: usize,
    pub difference_threshold: f32,
    pub cooldown: Duration,
    pub blank_level: f32,
    pub blank_stddev: f32,
}

impl StabilitySettings {
    pub fn from_autopunch(autopunch: &AutopunchSettings) -> Self {
        Self {
            stable_frames: autopunch.stable_frames,
            difference_threshold: autopunch.difference_threshold,
            cooldown: autopunch.cooldown,
            blank_level: DEFAULT_BLANK_LEVEL,
            blank_stddev: DEFAULT_BLANK_STDDEV,
        }
    }
}

pub struct StabilityDetector {
    settings: StabilitySettings,
    switch: AutoPunchSwitch,
    previous: Option<(Zeroizing<Vec<u8>>, u32, u32)>,
    /// Differences of the most recent consecutive pairs.
    history: VecDeque<f32>,
    /// Non-blank frames in the current steady run.
    steady_run: usize,
    cooldown_until: Option<Instant>,
}

impl StabilityDetector {
    pub fn new(settings: StabilitySettings, switch: AutoPunchSwitch) -> Self {
        Self {
            history: VecDeque::with_capacity(settings.stable_frames),
            settings,
            switch,
            previous: None,
            steady_run: 0,
            cooldown_until: None,
        }
    }

    /// Auto-punch entry point: suppressed entirely while the switch is off.
    pub fn observe(&mut self, frame: &Frame) -> bool {
        if !self.switch.is_enabled() {
            self.reset();
            return false;
        }
        self.observe_manual(frame)
    }

    /// Presence detection regardless of the auto-punch switch. Used by enrollment.
    pub fn observe_manual(&mut self, frame: &Frame) -> bool {
        let now = frame.captured_at;
        let in_cooldown = self.cooldown_until.is_some_and(|until| now < until);

        let blank = self.is_blank(frame);
        let difference = match &self.previous {
            Some((pixels, w, h)) if frame.same_shape(*w, *h) => {
                Some(normalized_difference(pixels, frame.pixels()))
            }
            _ => None,
        };
        self.previous = Some((
            Zeroizing::new(frame.pixels().to_vec()),
            frame.width,
            frame.height,
        ));

        match difference {
            Some(diff) if !blank => {
                if self.history.len() == self.settings.stable_frames {
                    self.history.pop_front();
                }
                self.history.push_back(diff);
                if diff < self.settings.difference_threshold {
                    self.steady_run += 1;
                } else {
                    self.steady_run = 1;
                }
            }
            _ => {
                // Blank platen or a shape change starts over.
                self.history.clear();
                self.steady_run = if blank { 0 } else { 1 };
            }
        }

        if in_cooldown {
            return false;
        }
        if self.steady_run >= self.settings.stable_frames {
            self.cooldown_until = Some(now + self.settings.cooldown);
            self.steady_run = 0;
            self.history.clear();
            return true;
        }
        false
    }

    pub fn is_blank(&self, frame: &Frame) -> bool {
        let stats = frame.intensity_stats();
        stats.stddev < self.settings.blank_stddev
            || stats.mean <= self.settings.blank_level
            || stats.mean >= 255.0 - self.settings.blank_level
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.history.clear();
        self.steady_run = 0;
    }
}
