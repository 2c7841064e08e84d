//! Capture pipeline: acquisition thread plus decision worker.
//!
//! The acquisition thread borrows the camera one pull at a time, runs the
//! stability detector and hands a frame to the worker only when a presence
//! event fires. The hand-off channel holds a single frame; if the worker is
//! still busy the event is dropped, so a slow extraction never queues stale
//! placements. The worker runs quality gate, match and punch decision and
//! publishes the result on the status board.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::ingest::{CameraArbiter, CaptureEvent};
use crate::matching::{MatchEngine, MatchOutcome};
use crate::punch::{PunchDecider, PunchDecision};
use crate::quality::{GateOutcome, QualityGate};
use crate::stability::{AutoPunchSwitch, StabilityDetector, StabilitySettings};
use crate::store::Store;
use crate::{Backoff, PunchType};

const IDLE_POLL: Duration = Duration::from_millis(50);

/// What the kiosk shows the person standing in front of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KioskStatus {
    Ready,
    CameraOffline {
        reason: String,
    },
    Punched {
        employee_code: String,
        name: String,
        punch_type: PunchType,
    },
    /// Same employee again inside the anti-bounce window.
    Suppressed {
        employee_code: String,
    },
    NoMatch,
    Ambiguous,
    LowQuality {
        score: Option<i32>,
    },
    Enrolling {
        employee_code: String,
        sample: u32,
        required: u32,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub status: KioskStatus,
    pub since: DateTime<Utc>,
}

/// Latest kiosk status, shared between the pipeline, enrollment and the API.
#[derive(Clone)]
pub struct StatusBoard(Arc<Mutex<StatusSnapshot>>);

impl Default for StatusBoard {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(StatusSnapshot {
            status: KioskStatus::Ready,
            since: Utc::now(),
        })))
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: KioskStatus) {
        if let Ok(mut current) = self.0.lock() {
            if current.status != status {
                log::debug!("kiosk status: {:?}", status);
            }
            current.status = status;
            current.since = Utc::now();
        }
    }

    pub fn current(&self) -> KioskStatus {
        self.snapshot().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match self.0.lock() {
            Ok(current) => current.clone(),
            Err(_) => StatusSnapshot {
                status: KioskStatus::Error {
                    message: "status lock poisoned".to_string(),
                },
                since: Utc::now(),
            },
        }
    }
}

/// Gate, match and punch for one presence event.
pub struct PunchWorker {
    pub gate: Arc<QualityGate>,
    pub engine: Arc<MatchEngine>,
    pub decider: Arc<PunchDecider>,
    pub store: Arc<Mutex<Store>>,
    pub required_templates: u32,
}

impl PunchWorker {
    pub fn process(&self, frame: &Frame, now: DateTime<Utc>) -> Result<KioskStatus> {
        let probe = match self.gate.evaluate(frame) {
            GateOutcome::Accepted(probe) => probe,
            GateOutcome::LowQuality { score } => {
                log::info!("probe rejected: low quality ({})", score);
                return Ok(KioskStatus::LowQuality { score: Some(score) });
            }
            GateOutcome::ExtractionFailed(err) => {
                log::warn!("probe rejected: extraction failed: {}", err);
                return Ok(KioskStatus::LowQuality { score: None });
            }
        };

        // Scoring runs without holding the store.
        let gallery = self
            .store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .enrolled_gallery(self.required_templates)?;

        match self.engine.identify(&probe, &gallery) {
            MatchOutcome::NoMatch { best_score } => {
                log::info!("no match (best score {:?})", best_score);
                Ok(KioskStatus::NoMatch)
            }
            MatchOutcome::Ambiguous { best, second } => {
                log::warn!(
                    "ambiguous match: {}={} vs {}={}",
                    best.employee_code,
                    best.score,
                    second.employee_code,
                    second.score
                );
                Ok(KioskStatus::Ambiguous)
            }
            MatchOutcome::Identified(candidate) => {
                log::info!(
                    "identified {} (score={})",
                    candidate.employee_code,
                    candidate.score
                );
                let mut store = self
                    .store
                    .lock()
                    .map_err(|_| anyhow!("store lock poisoned"))?;
                match self.decider.on_identified(&mut store, &candidate, now)? {
                    PunchDecision::Accepted(punch) => Ok(KioskStatus::Punched {
                        employee_code: punch.employee_code,
                        name: candidate.name,
                        punch_type: punch.punch_type,
                    }),
                    PunchDecision::Suppressed { employee_code, .. } => {
                        Ok(KioskStatus::Suppressed { employee_code })
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub stability: StabilitySettings,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

pub struct CapturePipeline {
    shutdown: Arc<AtomicBool>,
    status: StatusBoard,
    acquisition: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn start(
        arbiter: Arc<CameraArbiter>,
        worker: PunchWorker,
        switch: AutoPunchSwitch,
        settings: PipelineSettings,
        status: StatusBoard,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel::<Frame>(1);

        let worker_status = status.clone();
        let worker_handle = std::thread::Builder::new()
            .name("punch-worker".to_string())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let result = worker.process(&frame, Utc::now());
                    drop(frame);
                    match result {
                        Ok(next) => worker_status.set(next),
                        Err(err) => {
                            log::error!("punch worker error: {:#}", err);
                            worker_status.set(KioskStatus::Error {
                                message: err.to_string(),
                            });
                        }
                    }
                }
                log::info!("punch worker stopped");
            })
            .context("spawn punch worker")?;

        let acquisition_status = status.clone();
        let acquisition_shutdown = shutdown.clone();
        let acquisition = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                run_acquisition(
                    &arbiter,
                    tx,
                    switch,
                    settings,
                    &acquisition_status,
                    &acquisition_shutdown,
                )
            })
            .context("spawn capture thread")?;

        log::info!("capture pipeline started");
        Ok(Self {
            shutdown,
            status,
            acquisition: Some(acquisition),
            worker: Some(worker_handle),
        })
    }

    pub fn status(&self) -> KioskStatus {
        self.status.current()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        // Acquisition owns the sender; the worker drains and exits after it.
        if let Some(join) = self.acquisition.take() {
            join.join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        if let Some(join) = self.worker.take() {
            join.join()
                .map_err(|_| anyhow!("punch worker thread panicked"))?;
        }
        log::info!("capture pipeline stopped");
        Ok(())
    }
}

fn run_acquisition(
    arbiter: &CameraArbiter,
    tx: mpsc::SyncSender<Frame>,
    switch: AutoPunchSwitch,
    settings: PipelineSettings,
    status: &StatusBoard,
    shutdown: &AtomicBool,
) {
    let mut detector = StabilityDetector::new(settings.stability, switch);
    let mut backoff = Backoff::new(settings.reconnect_base, settings.reconnect_max);
    let mut offline = false;

    while !shutdown.load(Ordering::SeqCst) {
        let (event, healthy) = match arbiter.try_capture() {
            Ok(Some(mut source)) => {
                let event = source.pull();
                (event, source.is_healthy())
            }
            Ok(None) => {
                // Enrollment owns the camera.
                detector.reset();
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            Err(err) => {
                log::error!("camera unavailable: {:#}", err);
                std::thread::sleep(IDLE_POLL);
                continue;
            }
        };

        match event {
            CaptureEvent::Frame(frame) => {
                backoff.reset();
                if offline {
                    offline = false;
                    status.set(KioskStatus::Ready);
                }
                if !detector.observe(&frame) {
                    continue;
                }
                log::debug!("presence event");
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::debug!("worker busy; presence event dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::error!("punch worker gone; stopping capture");
                        break;
                    }
                }
            }
            CaptureEvent::NoFrame => {
                if !healthy && !offline {
                    offline = true;
                    status.set(KioskStatus::CameraOffline {
                        reason: "no frames from camera".to_string(),
                    });
                }
            }
            CaptureEvent::Failure(reason) => {
                detector.reset();
                let delay = backoff.next_delay();
                log::warn!("{}; retrying in {:?}", reason, delay);
                offline = true;
                status.set(KioskStatus::CameraOffline { reason });
                sleep_unless_shutdown(delay, shutdown);
            }
        }
    }
    log::info!("capture thread stopped");
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = std::time::Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(IDLE_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Extraction, MinutiaeExtractor, StubExtractor, StubScorer, TemplateScorer};
    use crate::ingest::{FrameSource, SourceSettings, SyntheticDevice, SyntheticStep};
    use crate::matching::Aggregation;
    use crate::quality::ProbeTemplate;
    use crate::stability::{DEFAULT_BLANK_LEVEL, DEFAULT_BLANK_STDDEV};
    use crate::{shared_memory_uri, CalibrationRoi};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::AtomicI32;
    use std::time::Instant;

    struct FixedQuality;

    impl MinutiaeExtractor for FixedQuality {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn extract(&self, _frame: &Frame, _timeout: Duration) -> Result<Extraction> {
            Ok(Extraction {
                template: vec![0xAB],
                quality_score: 50,
            })
        }
    }

    /// Every comparison returns the current dial value.
    struct DialScorer(Arc<AtomicI32>);

    impl TemplateScorer for DialScorer {
        fn name(&self) -> &'static str {
            "dial"
        }

        fn score(&self, _probe: &[u8], _gallery: &[u8], _timeout: Duration) -> Result<i32> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn enroll(store: &mut Store, code: &str, payload: Vec<u8>) -> Result<()> {
        let employee = store.create_employee(code, "Ana Ruiz", Utc::now())?;
        let templates = vec![
            ProbeTemplate {
                payload,
                quality_score: 40
            };
            3
        ];
        store.replace_templates(employee.id, &templates, Utc::now())?;
        Ok(())
    }

    fn worker(
        store: Arc<Mutex<Store>>,
        extractor: Arc<dyn MinutiaeExtractor>,
        scorer: Arc<dyn TemplateScorer>,
    ) -> Result<PunchWorker> {
        Ok(PunchWorker {
            gate: Arc::new(QualityGate::new(extractor, 20, Duration::from_secs(1))),
            engine: Arc::new(MatchEngine::new(
                scorer,
                40,
                5,
                Aggregation::Best,
                Duration::from_secs(1),
            )),
            decider: Arc::new(PunchDecider::new(Duration::from_secs(10), "CHECADOR-TEST")?),
            store,
            required_templates: 3,
        })
    }

    fn frame() -> Frame {
        Frame::new(vec![128; 16], 4, 4, Instant::now())
    }

    #[test]
    fn emp001_punches_in_out_then_suppressed() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        enroll(&mut store, "EMP001", vec![1, 2, 3])?;
        let store = Arc::new(Mutex::new(store));
        let dial = Arc::new(AtomicI32::new(55));
        let worker = worker(
            store.clone(),
            Arc::new(FixedQuality),
            Arc::new(DialScorer(dial.clone())),
        )?;
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();

        let first = worker.process(&frame(), t0)?;
        assert_eq!(
            first,
            KioskStatus::Punched {
                employee_code: "EMP001".to_string(),
                name: "Ana Ruiz".to_string(),
                punch_type: PunchType::In,
            }
        );

        dial.store(48, Ordering::SeqCst);
        let second = worker.process(&frame(), t0 + ChronoDuration::seconds(11))?;
        assert!(matches!(
            second,
            KioskStatus::Punched {
                punch_type: PunchType::Out,
                ..
            }
        ));

        let third = worker.process(&frame(), t0 + ChronoDuration::seconds(14))?;
        assert_eq!(
            third,
            KioskStatus::Suppressed {
                employee_code: "EMP001".to_string()
            }
        );

        let store = store.lock().map_err(|_| anyhow!("poisoned"))?;
        let punches = store.recent_punches(Some("EMP001"), 10)?;
        assert_eq!(punches.len(), 2);
        let employee = store
            .employee_by_code("EMP001")?
            .ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(employee.last_punch_direction, crate::PunchDirection::Out);
        Ok(())
    }

    #[test]
    fn below_threshold_is_no_match() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        enroll(&mut store, "EMP001", vec![1])?;
        let store = Arc::new(Mutex::new(store));
        let dial = Arc::new(AtomicI32::new(39));
        let worker = worker(store.clone(), Arc::new(FixedQuality), Arc::new(DialScorer(dial)))?;
        assert_eq!(worker.process(&frame(), Utc::now())?, KioskStatus::NoMatch);
        let store = store.lock().map_err(|_| anyhow!("poisoned"))?;
        assert!(store.recent_punches(None, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn two_close_candidates_are_ambiguous() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        enroll(&mut store, "EMP001", vec![1])?;
        enroll(&mut store, "EMP002", vec![2])?;
        let store = Arc::new(Mutex::new(store));
        let dial = Arc::new(AtomicI32::new(60));
        let worker = worker(store, Arc::new(FixedQuality), Arc::new(DialScorer(dial)))?;
        assert_eq!(worker.process(&frame(), Utc::now())?, KioskStatus::Ambiguous);
        Ok(())
    }

    #[test]
    fn blank_frame_reports_low_quality() -> Result<()> {
        let store = Arc::new(Mutex::new(Store::open(&shared_memory_uri())?));
        let worker = worker(
            store,
            Arc::new(StubExtractor::new()),
            Arc::new(StubScorer::new()),
        )?;
        let blank = Frame::new(vec![255; 64 * 64], 64, 64, Instant::now());
        assert!(matches!(
            worker.process(&blank, Utc::now())?,
            KioskStatus::LowQuality { .. }
        ));
        Ok(())
    }

    fn stability() -> StabilitySettings {
        StabilitySettings {
            stable_frames: 2,
            difference_threshold: 0.02,
            cooldown: Duration::from_secs(60),
            blank_level: DEFAULT_BLANK_LEVEL,
            blank_stddev: DEFAULT_BLANK_STDDEV,
        }
    }

    fn arbiter(steps: Vec<SyntheticStep>) -> Arc<CameraArbiter> {
        let source = FrameSource::new(
            Box::new(SyntheticDevice::scripted("stub://pipeline", 64, 64, steps)),
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
        );
        Arc::new(CameraArbiter::new(source))
    }

    fn wait_for(board: &StatusBoard, pred: impl Fn(&KioskStatus) -> bool) -> KioskStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = board.current();
            if pred(&status) || Instant::now() >= deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn placed_finger_is_punched_end_to_end() -> Result<()> {
        // Enroll templates rendered from the same synthetic finger.
        let extractor = StubExtractor::new();
        let sample = Frame::new(
            crate::ingest::synthetic::synthetic_fingerprint(64, 64, 1),
            64,
            64,
            Instant::now(),
        );
        let template = extractor.extract(&sample, Duration::from_secs(1))?.template;
        let mut store = Store::open(&shared_memory_uri())?;
        enroll(&mut store, "EMP001", template)?;
        let store = Arc::new(Mutex::new(store));

        let mut steps = vec![SyntheticStep::Blank; 3];
        steps.extend(vec![SyntheticStep::Finger(1); 4]);
        let board = StatusBoard::new();
        let pipeline = CapturePipeline::start(
            arbiter(steps),
            worker(
                store.clone(),
                Arc::new(StubExtractor::new()),
                Arc::new(StubScorer::new()),
            )?,
            AutoPunchSwitch::new(true),
            PipelineSettings {
                stability: stability(),
                reconnect_base: Duration::from_millis(5),
                reconnect_max: Duration::from_millis(20),
            },
            board.clone(),
        )?;
        let status = wait_for(&board, |s| matches!(s, KioskStatus::Punched { .. }));
        pipeline.stop()?;

        assert!(matches!(
            status,
            KioskStatus::Punched {
                punch_type: PunchType::In,
                ..
            }
        ));
        let store = store.lock().map_err(|_| anyhow!("poisoned"))?;
        // Cooldown keeps one placement to one punch.
        assert_eq!(store.recent_punches(None, 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn camera_failure_is_reported_and_recovers() -> Result<()> {
        let store = Arc::new(Mutex::new(Store::open(&shared_memory_uri())?));
        let board = StatusBoard::new();
        let steps = vec![
            SyntheticStep::Fail,
            SyntheticStep::Fail,
            SyntheticStep::Blank,
            SyntheticStep::Blank,
        ];
        let arbiter = arbiter(steps);
        let pipeline = CapturePipeline::start(
            arbiter.clone(),
            worker(
                store,
                Arc::new(StubExtractor::new()),
                Arc::new(StubScorer::new()),
            )?,
            AutoPunchSwitch::new(true),
            PipelineSettings {
                stability: stability(),
                reconnect_base: Duration::from_millis(5),
                reconnect_max: Duration::from_millis(20),
            },
            board.clone(),
        )?;
        let status = wait_for(&board, |s| *s == KioskStatus::Ready);
        let failures = arbiter.with_source(|s| s.stats().failures);
        pipeline.stop()?;
        assert_eq!(status, KioskStatus::Ready);
        assert!(failures? >= 2);
        Ok(())
    }

    #[test]
    fn enrollment_suspends_punching() -> Result<()> {
        let store = Arc::new(Mutex::new(Store::open(&shared_memory_uri())?));
        let arbiter = arbiter(vec![SyntheticStep::Finger(1); 20]);
        let camera = arbiter.acquire_for_enrollment(Duration::from_millis(100))?;
        let board = StatusBoard::new();
        let pipeline = CapturePipeline::start(
            arbiter.clone(),
            worker(
                store.clone(),
                Arc::new(StubExtractor::new()),
                Arc::new(StubScorer::new()),
            )?,
            AutoPunchSwitch::new(true),
            PipelineSettings {
                stability: stability(),
                reconnect_base: Duration::from_millis(5),
                reconnect_max: Duration::from_millis(20),
            },
            board.clone(),
        )?;
        std::thread::sleep(Duration::from_millis(150));
        let frames_while_enrolling = camera.stats().frames_captured;
        drop(camera);
        pipeline.stop()?;
        assert_eq!(frames_while_enrolling, 0);
        assert_eq!(board.current(), KioskStatus::Ready);
        Ok(())
    }
}
