//! Composition root: wires the stages together and exposes the operator actions
//! the control API and the daemon call.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capability::Toolkit;
use crate::config::{CameraSettings, KioskConfig};
use crate::enrollment::{
    EnrollmentLocks, EnrollmentOutcome, EnrollmentRequest, EnrollmentSession, EnrollmentSettings,
};
use crate::ingest::{CameraArbiter, CameraMode, FrameSource, SourceStats};
use crate::matching::MatchEngine;
use crate::pipeline::{CapturePipeline, KioskStatus, PipelineSettings, PunchWorker, StatusBoard, StatusSnapshot};
use crate::punch::PunchDecider;
use crate::quality::QualityGate;
use crate::stability::{AutoPunchSwitch, StabilitySettings};
use crate::store::Store;
use crate::sync::{
    HttpSyncClient, SyncClient, SyncHandle, SyncQueue, SyncSettings, SyncState, SyncStatusReport,
};
use crate::CalibrationRoi;

const CAMERA_RECONNECT_BASE: Duration = Duration::from_millis(500);
const CAMERA_RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub device_id: String,
    pub kiosk: StatusSnapshot,
    pub camera_mode: CameraModeLabel,
    pub camera: SourceStats,
    pub autopunch_enabled: bool,
    pub enrolling: Option<String>,
    pub last_enrollment: Option<EnrollmentOutcome>,
    pub employees: usize,
    pub sync: SyncStatusReport,
}

/// Reply to an accepted enrollment request.
#[derive(Clone, Debug, Serialize)]
pub struct EnrollmentStarted {
    pub employee_code: String,
    /// Set when re-enrolling an existing employee.
    pub employee_id: Option<i64>,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraModeLabel {
    Punch,
    Enrollment,
}

impl From<CameraMode> for CameraModeLabel {
    fn from(mode: CameraMode) -> Self {
        match mode {
            CameraMode::Punch => CameraModeLabel::Punch,
            CameraMode::Enrollment => CameraModeLabel::Enrollment,
        }
    }
}

struct ActiveEnrollment {
    employee_code: String,
    cancel: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct Kiosk {
    device_id: String,
    camera: CameraSettings,
    enrollment: EnrollmentSettings,
    arbiter: Arc<CameraArbiter>,
    store: Arc<Mutex<Store>>,
    gate: Arc<QualityGate>,
    locks: EnrollmentLocks,
    switch: AutoPunchSwitch,
    status: StatusBoard,
    sync_settings: SyncSettings,
    pipeline: Mutex<Option<CapturePipeline>>,
    sync: Mutex<Option<SyncHandle>>,
    active_enrollment: Mutex<Option<ActiveEnrollment>>,
    last_enrollment: Arc<Mutex<Option<EnrollmentOutcome>>>,
}

impl Kiosk {
    /// Start the capture pipeline and, when enabled, the HTTP sync worker.
    pub fn start(config: &KioskConfig, toolkit: Toolkit, source: FrameSource) -> Result<Arc<Self>> {
        let client: Option<Box<dyn SyncClient>> = if config.server.enabled {
            Some(Box::new(HttpSyncClient::from_settings(&config.server)?))
        } else {
            None
        };
        Self::start_with_client(config, toolkit, source, client)
    }

    pub fn start_with_client(
        config: &KioskConfig,
        toolkit: Toolkit,
        source: FrameSource,
        sync_client: Option<Box<dyn SyncClient>>,
    ) -> Result<Arc<Self>> {
        let fp = &config.fingerprint;
        let store = Arc::new(Mutex::new(Store::open(&config.db_path)?));
        let arbiter = Arc::new(CameraArbiter::new(source));
        let gate = Arc::new(QualityGate::new(
            toolkit.extractor.clone(),
            fp.min_quality_score,
            fp.extract_timeout,
        ));
        let engine = Arc::new(MatchEngine::new(
            toolkit.scorer.clone(),
            fp.match_threshold,
            fp.ambiguity_margin,
            fp.aggregation,
            fp.match_timeout,
        ));
        let decider = Arc::new(PunchDecider::new(config.antibounce, &config.device_id)?);
        let switch = AutoPunchSwitch::new(config.autopunch.enabled);
        let status = StatusBoard::new();
        let stability = StabilitySettings::from_autopunch(&config.autopunch);

        let pipeline = CapturePipeline::start(
            arbiter.clone(),
            PunchWorker {
                gate: gate.clone(),
                engine,
                decider,
                store: store.clone(),
                required_templates: fp.required_templates,
            },
            switch.clone(),
            PipelineSettings {
                stability: stability.clone(),
                reconnect_base: CAMERA_RECONNECT_BASE,
                reconnect_max: CAMERA_RECONNECT_MAX,
            },
            status.clone(),
        )?;

        let sync_settings = SyncSettings::from_server(&config.server);
        let sync = match sync_client {
            Some(client) if sync_settings.enabled => {
                let queue = SyncQueue::new(
                    &config.db_path,
                    client,
                    sync_settings.clone(),
                    &config.device_id,
                )?;
                Some(queue.spawn()?)
            }
            _ => {
                log::info!("server sync disabled; punches stay local");
                None
            }
        };

        Ok(Arc::new(Self {
            device_id: config.device_id.clone(),
            camera: config.camera.clone(),
            enrollment: EnrollmentSettings {
                required_templates: fp.required_templates,
                timeout: config.enrollment_timeout,
                stability,
            },
            arbiter,
            store,
            gate,
            locks: EnrollmentLocks::new(),
            switch,
            status,
            sync_settings,
            pipeline: Mutex::new(Some(pipeline)),
            sync: Mutex::new(sync),
            active_enrollment: Mutex::new(None),
            last_enrollment: Arc::new(Mutex::new(None)),
        }))
    }

    pub fn store(&self) -> Arc<Mutex<Store>> {
        self.store.clone()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn status_report(&self) -> Result<StatusReport> {
        let store = self
            .store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let sync_state = self.sync_state();
        let sync = SyncStatusReport::compose(&self.sync_settings, &store, sync_state)?;
        let employees = store.list_employees()?.iter().filter(|e| e.employee.active).count();
        drop(store);

        // Busy while a pull or an enrollment session holds the camera.
        let camera = self.arbiter.stats()?;
        let enrolling = self
            .active_enrollment
            .lock()
            .map_err(|_| anyhow!("enrollment state poisoned"))?
            .as_ref()
            .filter(|active| !active.join.is_finished())
            .map(|active| active.employee_code.clone());

        Ok(StatusReport {
            device_id: self.device_id.clone(),
            kiosk: self.status.snapshot(),
            camera_mode: self.arbiter.mode().into(),
            camera,
            autopunch_enabled: self.switch.is_enabled(),
            enrolling,
            last_enrollment: self
                .last_enrollment
                .lock()
                .map(|last| last.clone())
                .unwrap_or_default(),
            employees,
            sync,
        })
    }

    fn sync_state(&self) -> SyncState {
        self.sync
            .lock()
            .ok()
            .and_then(|sync| sync.as_ref().map(|handle| handle.state()))
            .unwrap_or_default()
    }

    /// Begin guided enrollment on a background thread. Returns once the
    /// request is validated and the per-code lock is held; a new employee
    /// is only written when the session completes.
    pub fn start_enrollment(&self, request: EnrollmentRequest) -> Result<EnrollmentStarted> {
        let mut active = self
            .active_enrollment
            .lock()
            .map_err(|_| anyhow!("enrollment state poisoned"))?;
        if let Some(current) = active.as_ref() {
            if !current.join.is_finished() {
                return Err(anyhow!(
                    "enrollment already in progress for {}",
                    current.employee_code
                ));
            }
        }
        if let Some(finished) = active.take() {
            let _ = finished.join.join();
        }

        let session = {
            let mut store = self
                .store
                .lock()
                .map_err(|_| anyhow!("store lock poisoned"))?;
            EnrollmentSession::begin(&mut store, &self.locks, &request, self.enrollment.clone())?
        };
        let started = EnrollmentStarted {
            employee_code: session.target().employee_code().to_string(),
            employee_id: session.target().employee_id(),
        };
        let cancel = session.cancel_handle();

        let arbiter = self.arbiter.clone();
        let gate = self.gate.clone();
        let store = self.store.clone();
        let status = self.status.clone();
        let last = self.last_enrollment.clone();
        let camera_wait = self.camera.read_timeout * 2 + Duration::from_secs(1);
        let code = started.employee_code.clone();
        let required = self.enrollment.required_templates;
        let join = std::thread::Builder::new()
            .name("enrollment".to_string())
            .spawn(move || {
                status.set(KioskStatus::Enrolling {
                    employee_code: code.clone(),
                    sample: 0,
                    required,
                });
                let result = arbiter
                    .acquire_for_enrollment(camera_wait)
                    .and_then(|mut camera| {
                        session.run(&mut camera, &gate, &store, |progress| {
                            status.set(KioskStatus::Enrolling {
                                employee_code: code.clone(),
                                sample: progress.sample,
                                required: progress.required,
                            });
                        })
                    });
                match result {
                    Ok(outcome) => {
                        if let Ok(mut last) = last.lock() {
                            *last = Some(outcome);
                        }
                        status.set(KioskStatus::Ready);
                    }
                    Err(err) => {
                        log::error!("enrollment for {} failed: {:#}", code, err);
                        status.set(KioskStatus::Error {
                            message: format!("enrollment failed: {}", err),
                        });
                    }
                }
            })
            .context("spawn enrollment thread")?;

        *active = Some(ActiveEnrollment {
            employee_code: started.employee_code.clone(),
            cancel,
            join,
        });
        Ok(started)
    }

    /// Cancel the running enrollment, if any. Nothing it captured is kept.
    pub fn cancel_enrollment(&self) -> Result<bool> {
        let active = self
            .active_enrollment
            .lock()
            .map_err(|_| anyhow!("enrollment state poisoned"))?;
        match active.as_ref() {
            Some(current) if !current.join.is_finished() => {
                current.cancel.store(true, Ordering::SeqCst);
                log::info!("enrollment cancel requested for {}", current.employee_code);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn set_autopunch(&self, enabled: bool) {
        self.switch.set(enabled);
    }

    pub fn autopunch_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    pub fn trigger_sync(&self) -> Result<()> {
        let sync = self
            .sync
            .lock()
            .map_err(|_| anyhow!("sync state poisoned"))?;
        match sync.as_ref() {
            Some(handle) => handle.trigger(),
            None => Err(anyhow!("server sync is disabled")),
        }
    }

    /// Explicit recalibration: persist the ROI and apply it to later captures.
    pub fn recalibrate(&self, roi: CalibrationRoi) -> Result<()> {
        if !roi.fits(self.camera.width, self.camera.height) {
            return Err(anyhow!(
                "roi ({}, {}, {}, {}) does not fit {}x{}",
                roi.x,
                roi.y,
                roi.width,
                roi.height,
                self.camera.width,
                self.camera.height
            ));
        }
        self.store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .set_calibration(&roi, Utc::now())?;
        if !self.arbiter.recalibrate(roi)? {
            log::info!("camera busy; calibration {:?} applies at the next capture", roi);
        }
        Ok(())
    }

    /// Stop enrollment, capture and sync threads.
    pub fn shutdown(&self) -> Result<()> {
        let active = self
            .active_enrollment
            .lock()
            .map_err(|_| anyhow!("enrollment state poisoned"))?
            .take();
        if let Some(active) = active {
            active.cancel.store(true, Ordering::SeqCst);
            active
                .join
                .join()
                .map_err(|_| anyhow!("enrollment thread panicked"))?;
        }
        let pipeline = self
            .pipeline
            .lock()
            .map_err(|_| anyhow!("pipeline state poisoned"))?
            .take();
        if let Some(pipeline) = pipeline {
            pipeline.stop()?;
        }
        let sync = self
            .sync
            .lock()
            .map_err(|_| anyhow!("sync state poisoned"))?
            .take();
        if let Some(sync) = sync {
            sync.stop()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{SourceSettings, SyntheticDevice, SyntheticStep};
    use crate::shared_memory_uri;
    use std::time::Instant;

    fn config(db_path: &str) -> Result<KioskConfig> {
        let mut cfg = KioskConfig::from_toml_str(
            r#"
[app]
device_id = "CHECADOR-TEST"

[camera]
device = "stub://kiosk"
width = 64
height = 64
read_timeout_ms = 5

[fingerprint]
backend = "stub"
required_templates = 2

[autopunch]
enabled = false
stable_frames = 2
cooldown_seconds = 0

[enrollment]
timeout_seconds = 5
"#,
        )?;
        cfg.db_path = db_path.to_string();
        Ok(cfg)
    }

    fn source(steps: Vec<SyntheticStep>) -> FrameSource {
        FrameSource::new(
            Box::new(SyntheticDevice::scripted("stub://kiosk", 64, 64, steps)),
            CalibrationRoi {
                x: 0,
                y: 0,
                width: 64,
                height: 64,
            },
            SourceSettings {
                interval: Duration::from_millis(1),
                read_timeout: Duration::from_millis(1),
                unhealthy_after_timeouts: 1_000,
            },
        )
    }

    fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn enrollment_runs_in_background_and_reports_outcome() -> Result<()> {
        let uri = shared_memory_uri();
        let cfg = config(&uri)?;
        // The unscripted device alternates empty platen and steady placements.
        let device = SyntheticDevice::new("stub://kiosk", 64, 64);
        let source = FrameSource::new(
            Box::new(device),
            CalibrationRoi::new(0, 0, 64, 64)?,
            SourceSettings {
                interval: Duration::from_millis(1),
                read_timeout: Duration::from_millis(1),
                unhealthy_after_timeouts: 1_000,
            },
        );
        let kiosk = Kiosk::start(&cfg, Toolkit::stub(), source)?;
        assert!(!kiosk.autopunch_enabled());
        let started = kiosk.start_enrollment(EnrollmentRequest {
            employee_code: "EMP001".to_string(),
            name: "Ana Ruiz".to_string(),
            replace: false,
        })?;
        assert_eq!(started.employee_code, "EMP001");
        assert_eq!(started.employee_id, None);
        assert!(kiosk
            .start_enrollment(EnrollmentRequest {
                employee_code: "EMP002".to_string(),
                name: "Luis".to_string(),
                replace: false,
            })
            .is_err());

        let done = wait_until(|| {
            kiosk
                .status_report()
                .map(|r| r.last_enrollment.is_some())
                .unwrap_or(false)
        });
        assert!(done);
        let report = kiosk.status_report()?;
        let employee_id = match report.last_enrollment {
            Some(EnrollmentOutcome::Completed {
                employee_id,
                templates: 2,
                ..
            }) => employee_id,
            other => return Err(anyhow!("unexpected outcome {:?}", other)),
        };
        assert_eq!(report.employees, 1);
        let store = kiosk.store();
        let templates = store
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .templates_for(employee_id)?;
        assert_eq!(templates.len(), 2);
        kiosk.shutdown()?;
        Ok(())
    }

    #[test]
    fn recalibration_is_persisted_and_bounds_checked() -> Result<()> {
        let uri = shared_memory_uri();
        let kiosk = Kiosk::start(&config(&uri)?, Toolkit::stub(), source(vec![]))?;
        assert!(kiosk.recalibrate(CalibrationRoi::new(32, 32, 64, 64)?).is_err());
        let roi = CalibrationRoi::new(8, 8, 48, 48)?;
        kiosk.recalibrate(roi)?;
        let stored = kiosk
            .store()
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .calibration()?;
        assert_eq!(stored, Some(roi));
        kiosk.shutdown()?;
        Ok(())
    }

    #[test]
    fn recalibration_during_enrollment_returns_immediately() -> Result<()> {
        let uri = shared_memory_uri();
        // The device never delivers a frame, so the session runs to its timeout.
        let kiosk = Kiosk::start(&config(&uri)?, Toolkit::stub(), source(vec![]))?;
        kiosk.start_enrollment(EnrollmentRequest {
            employee_code: "EMP007".to_string(),
            name: "Rosa".to_string(),
            replace: false,
        })?;
        assert!(wait_until(|| kiosk.arbiter.mode() == CameraMode::Enrollment));

        let started = Instant::now();
        let roi = CalibrationRoi::new(8, 8, 48, 48)?;
        kiosk.recalibrate(roi)?;
        let report = kiosk.status_report()?;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.enrolling.as_deref(), Some("EMP007"));
        assert!(matches!(report.camera_mode, CameraModeLabel::Enrollment));

        assert!(kiosk.cancel_enrollment()?);
        assert!(wait_until(|| kiosk.arbiter.mode() == CameraMode::Punch));
        // The capture pipeline picks the new ROI up on its next pull.
        assert!(wait_until(|| kiosk
            .arbiter
            .with_source(|s| s.roi())
            .map(|current| current == roi)
            .unwrap_or(false)));
        kiosk.shutdown()?;
        Ok(())
    }

    #[test]
    fn cancelled_first_enrollment_leaves_no_employee() -> Result<()> {
        let uri = shared_memory_uri();
        let kiosk = Kiosk::start(&config(&uri)?, Toolkit::stub(), source(vec![]))?;
        kiosk.start_enrollment(EnrollmentRequest {
            employee_code: "NEW01".to_string(),
            name: "Nuevo".to_string(),
            replace: false,
        })?;
        assert!(kiosk.cancel_enrollment()?);
        assert!(wait_until(|| kiosk
            .status_report()
            .map(|r| r.last_enrollment == Some(EnrollmentOutcome::Cancelled))
            .unwrap_or(false)));

        let report = kiosk.status_report()?;
        assert_eq!(report.employees, 0);
        let store = kiosk.store();
        let store = store.lock().map_err(|_| anyhow!("poisoned"))?;
        assert!(store.employee_by_code("NEW01")?.is_none());
        assert!(store.list_employees()?.is_empty());
        drop(store);

        // A retry with a different name is a fresh request.
        kiosk.start_enrollment(EnrollmentRequest {
            employee_code: "NEW01".to_string(),
            name: "Nuevo Nombre".to_string(),
            replace: false,
        })?;
        kiosk.shutdown()?;
        Ok(())
    }

    #[test]
    fn sync_trigger_fails_when_disabled() -> Result<()> {
        let uri = shared_memory_uri();
        let kiosk = Kiosk::start(&config(&uri)?, Toolkit::stub(), source(vec![]))?;
        assert!(kiosk.trigger_sync().is_err());
        let report = kiosk.status_report()?;
        assert!(!report.sync.enabled);
        assert_eq!(report.device_id, "CHECADOR-TEST");
        kiosk.shutdown()?;
        Ok(())
    }

    #[test]
    fn cancel_without_session_is_noop() -> Result<()> {
        let uri = shared_memory_uri();
        let kiosk = Kiosk::start(&config(&uri)?, Toolkit::stub(), source(vec![]))?;
        assert!(!kiosk.cancel_enrollment()?);
        kiosk.shutdown()?;
        Ok(())
    }
}
