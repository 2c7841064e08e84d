//! Guided enrollment.
//!
//! A session owns the camera, runs presence detection in manual mode, and
//! buffers quality-passing templates until `required_templates` are held.
//! Only then are they written, replacing any previous set in one
//! transaction. A first enrollment creates the employee in that same
//! transaction. Cancel and timeout discard the buffer and leave no record.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ingest::{CaptureEvent, FrameSource};
use crate::quality::{GateOutcome, ProbeTemplate, QualityGate};
use crate::stability::{AutoPunchSwitch, StabilityDetector, StabilitySettings};
use crate::store::Store;
use crate::Employee;

/// Single-writer lock per employee code, shared by every session in the process.
#[derive(Clone, Default)]
pub struct EnrollmentLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl EnrollmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, employee_code: &str) -> Result<EnrollmentLockGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("enrollment lock poisoned"))?;
        if !held.insert(employee_code.to_string()) {
            return Err(anyhow!(
                "enrollment already in progress for employee {}",
                employee_code
            ));
        }
        Ok(EnrollmentLockGuard {
            locks: self.clone(),
            employee_code: employee_code.to_string(),
        })
    }

    pub fn is_held(&self, employee_code: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(employee_code))
            .unwrap_or(false)
    }
}

pub struct EnrollmentLockGuard {
    locks: EnrollmentLocks,
    employee_code: String,
}

impl Drop for EnrollmentLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.employee_code);
        }
    }
}

#[derive(Clone, Debug)]
pub struct EnrollmentRequest {
    pub employee_code: String,
    pub name: String,
    /// Re-enroll an employee that already holds templates.
    pub replace: bool,
}

#[derive(Clone, Debug)]
pub struct EnrollmentSettings {
    pub required_templates: u32,
    pub timeout: Duration,
    pub stability: StabilitySettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollmentOutcome {
    Completed {
        employee_id: i64,
        employee_code: String,
        templates: u32,
    },
    Cancelled,
    TimedOut,
}

/// One capture attempt, reported to the operator as it happens.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureProgress {
    /// Templates buffered so far, including this one if accepted.
    pub sample: u32,
    pub required: u32,
    pub quality: Option<i32>,
    pub accepted: bool,
    pub message: String,
}

/// Who a session enrolls. A new employee exists only in memory until commit.
#[derive(Clone, Debug)]
pub enum EnrollmentTarget {
    Existing(Employee),
    New { employee_code: String, name: String },
}

impl EnrollmentTarget {
    pub fn employee_code(&self) -> &str {
        match self {
            EnrollmentTarget::Existing(employee) => &employee.employee_code,
            EnrollmentTarget::New { employee_code, .. } => employee_code,
        }
    }

    pub fn employee_id(&self) -> Option<i64> {
        match self {
            EnrollmentTarget::Existing(employee) => Some(employee.id),
            EnrollmentTarget::New { .. } => None,
        }
    }
}

pub struct EnrollmentSession {
    target: EnrollmentTarget,
    settings: EnrollmentSettings,
    cancel: Arc<AtomicBool>,
    buffered: Vec<ProbeTemplate>,
    _lock: EnrollmentLockGuard,
}

impl EnrollmentSession {
    /// Resolve the employee (nothing is written for a new code) and take the
    /// enrollment lock for its code.
    pub fn begin(
        store: &mut Store,
        locks: &EnrollmentLocks,
        request: &EnrollmentRequest,
        settings: EnrollmentSettings,
    ) -> Result<Self> {
        if settings.required_templates == 0 {
            return Err(anyhow!("required_templates must be at least 1"));
        }
        crate::validate_employee_code(&request.employee_code)?;
        let target = match store.employee_by_code(&request.employee_code)? {
            Some(existing) => {
                if !existing.active {
                    return Err(anyhow!(
                        "employee {} is inactive",
                        existing.employee_code
                    ));
                }
                let enrolled = !store.templates_for(existing.id)?.is_empty();
                if enrolled && !request.replace {
                    return Err(anyhow!(
                        "employee {} is already enrolled; request replace to re-enroll",
                        existing.employee_code
                    ));
                }
                EnrollmentTarget::Existing(existing)
            }
            None => {
                let name = request.name.trim();
                if name.is_empty() {
                    return Err(anyhow!("employee name must not be empty"));
                }
                EnrollmentTarget::New {
                    employee_code: request.employee_code.clone(),
                    name: name.to_string(),
                }
            }
        };
        let lock = locks.try_acquire(target.employee_code())?;
        log::info!(
            "enrollment started for {} ({} samples)",
            target.employee_code(),
            settings.required_templates
        );
        Ok(Self {
            target,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            buffered: Vec::new(),
            _lock: lock,
        })
    }

    pub fn target(&self) -> &EnrollmentTarget {
        &self.target
    }

    /// Setting the returned flag stops the session at its next frame.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Capture until the template set is complete, then commit it.
    pub fn run(
        mut self,
        camera: &mut FrameSource,
        gate: &QualityGate,
        store: &Mutex<Store>,
        mut progress: impl FnMut(&CaptureProgress),
    ) -> Result<EnrollmentOutcome> {
        let required = self.settings.required_templates;
        let deadline = Instant::now() + self.settings.timeout;
        // Manual mode: the auto-punch switch does not gate enrollment captures.
        let mut detector =
            StabilityDetector::new(self.settings.stability.clone(), AutoPunchSwitch::new(false));

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                log::info!("enrollment cancelled for {}", self.target.employee_code());
                return Ok(EnrollmentOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "enrollment timed out for {} with {}/{} samples",
                    self.target.employee_code(),
                    self.buffered.len(),
                    required
                );
                return Ok(EnrollmentOutcome::TimedOut);
            }

            let frame = match camera.pull() {
                CaptureEvent::Frame(frame) => frame,
                CaptureEvent::NoFrame => continue,
                CaptureEvent::Failure(err) => {
                    log::warn!("enrollment capture failed: {}", err);
                    continue;
                }
            };
            if !detector.observe_manual(&frame) {
                continue;
            }

            let outcome = gate.evaluate(&frame);
            drop(frame);
            match outcome {
                GateOutcome::Accepted(probe) => {
                    let quality = probe.quality_score;
                    self.buffered.push(probe);
                    let sample = self.buffered.len() as u32;
                    log::info!(
                        "sample {}/{} captured for {}, quality={}",
                        sample,
                        required,
                        self.target.employee_code(),
                        quality
                    );
                    progress(&CaptureProgress {
                        sample,
                        required,
                        quality: Some(quality),
                        accepted: true,
                        message: "sample captured".to_string(),
                    });
                    if sample >= required {
                        return self.commit(store);
                    }
                }
                rejected => {
                    let quality = match &rejected {
                        GateOutcome::LowQuality { score } => Some(*score),
                        _ => None,
                    };
                    let message = rejected
                        .rejection_reason()
                        .unwrap_or_else(|| "rejected".to_string());
                    progress(&CaptureProgress {
                        sample: self.buffered.len() as u32,
                        required,
                        quality,
                        accepted: false,
                        message,
                    });
                }
            }
        }
    }

    fn commit(self, store: &Mutex<Store>) -> Result<EnrollmentOutcome> {
        let mut store = store.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let now = Utc::now();
        let employee = match &self.target {
            EnrollmentTarget::Existing(employee) => {
                store.replace_templates(employee.id, &self.buffered, now)?;
                employee.clone()
            }
            EnrollmentTarget::New {
                employee_code,
                name,
            } => store.create_employee_with_templates(employee_code, name, &self.buffered, now)?,
        };
        log::info!(
            "enrollment completed for {} ({} templates)",
            employee.employee_code,
            self.buffered.len()
        );
        Ok(EnrollmentOutcome::Completed {
            employee_id: employee.id,
            employee_code: employee.employee_code,
            templates: self.buffered.len() as u32,
        })
    }
}
