//! Checador fingerprint time clock
//!
//! This crate implements the capture-to-punch core of an offline-first
//! attendance kiosk.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> StabilityDetector -> QualityGate -> MatchEngine -> PunchDecider
//!                                                                      |
//!                                                               punch store (SQLite)
//!                                                                      |
//!                                                                  SyncQueue -> server
//! ```
//!
//! Enrollment shares the acquisition and quality stages but writes templates
//! instead of punches. The camera is a single exclusive resource held by
//! either the capture pipeline or an enrollment session.
//!
//! # Module Structure
//!
//! - `frame`: grayscale ROI frames and pixel metrics
//! - `ingest`: frame sources (V4L2, synthetic) and the camera arbiter
//! - `stability`, `quality`, `matching`, `punch`: pipeline stages
//! - `enrollment`: guided template capture
//! - `store`: SQLite persistence
//! - `sync`: durable punch forwarding
//! - `pipeline`, `kiosk`: threads and the operator actions built on them
//! - `api`: loopback control API
//! - Core types: Employee, FingerprintTemplate, Punch, CalibrationRoi

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Utc};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

pub mod api;
pub mod capability;
pub mod config;
pub mod enrollment;
pub mod frame;
pub mod ingest;
pub mod kiosk;
pub mod matching;
pub mod pipeline;
pub mod punch;
pub mod quality;
pub mod stability;
pub mod store;
pub mod sync;
pub mod ui;

pub use capability::{Extraction, MinutiaeExtractor, TemplateScorer, Toolkit};
pub use config::KioskConfig;
pub use enrollment::{EnrollmentLocks, EnrollmentOutcome, EnrollmentSession, EnrollmentTarget};
pub use frame::Frame;
pub use ingest::{CameraArbiter, CaptureDevice, CaptureEvent, FrameSource, SyntheticDevice};
pub use kiosk::{EnrollmentStarted, Kiosk};
pub use matching::{Aggregation, MatchEngine, MatchOutcome};
pub use pipeline::{CapturePipeline, KioskStatus};
pub use punch::{PunchDecider, PunchDecision};
pub use quality::{GateOutcome, ProbeTemplate, QualityGate};
pub use stability::{AutoPunchSwitch, StabilityDetector};
pub use store::Store;
pub use sync::{HttpSyncClient, SyncClient, SyncQueue};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:checador_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Random 128-bit identifier, hex encoded. Used as the idempotency key for punches.
pub fn new_punch_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// -------------------- Employee Code Discipline --------------------

/// Employee codes travel to the HR server and appear in file names and logs.
///
/// Allowed: "EMP001", "night_shift-07"
/// Disallowed: whitespace, slashes, anything longer than 32 characters.
pub fn validate_employee_code(code: &str) -> Result<()> {
    static EMPLOYEE_CODE_RE: OnceLock<std::result::Result<regex::Regex, regex::Error>> =
        OnceLock::new();
    let re = EMPLOYEE_CODE_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,32}$"))
        .as_ref()
        .map_err(|e| anyhow!("employee code pattern: {}", e))?;
    if !re.is_match(code) {
        return Err(anyhow!(
            "employee_code must match ^[A-Za-z0-9_-]{{1,32}}$ (got '{}')",
            code
        ));
    }
    Ok(())
}

// -------------------- Punch Types --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum PunchType {
    In,
    Out,
}

impl PunchType {
    pub fn as_str(self) -> &'static str {
        match self {
            PunchType::In => "IN",
            PunchType::Out => "OUT",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "IN" => Ok(PunchType::In),
            "OUT" => Ok(PunchType::Out),
            other => Err(anyhow!("unknown punch type '{}'", other)),
        }
    }
}

/// Last recorded direction of an employee. `None` until the first punch.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PunchDirection {
    #[default]
    None,
    In,
    Out,
}

impl PunchDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PunchDirection::None => "NONE",
            PunchDirection::In => "IN",
            PunchDirection::Out => "OUT",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "NONE" => Ok(PunchDirection::None),
            "IN" => Ok(PunchDirection::In),
            "OUT" => Ok(PunchDirection::Out),
            other => Err(anyhow!("unknown punch direction '{}'", other)),
        }
    }

    /// Auto-toggle: NONE and OUT punch in, IN punches out.
    pub fn next_punch(self) -> PunchType {
        match self {
            PunchDirection::None | PunchDirection::Out => PunchType::In,
            PunchDirection::In => PunchType::Out,
        }
    }
}

impl From<PunchType> for PunchDirection {
    fn from(value: PunchType) -> Self {
        match value {
            PunchType::In => PunchDirection::In,
            PunchType::Out => PunchDirection::Out,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(SyncStatus::Pending),
            "SYNCED" => Ok(SyncStatus::Synced),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(anyhow!("unknown sync status '{}'", other)),
        }
    }
}

// -------------------- Records --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Employee {
    pub id: i64,
    pub employee_code: String,
    pub name: String,
    pub active: bool,
    pub last_punch_direction: PunchDirection,
    pub last_punch_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A stored minutiae template. Payload bytes are opaque to the kiosk.
#[derive(Clone, Debug)]
pub struct FingerprintTemplate {
    pub id: i64,
    pub employee_id: i64,
    pub payload: Vec<u8>,
    pub quality_score: i32,
    pub capture_index: u32,
}

/// An enrolled employee together with its full template set, as seen by the matcher.
#[derive(Clone, Debug)]
pub struct EnrolledEmployee {
    pub employee_id: i64,
    pub employee_code: String,
    pub name: String,
    pub templates: Vec<FingerprintTemplate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Punch {
    pub id: i64,
    pub punch_uid: String,
    pub employee_id: i64,
    pub employee_code: String,
    pub device_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub timestamp_local: DateTime<FixedOffset>,
    pub punch_type: PunchType,
    pub match_score: i32,
    pub sync_status: SyncStatus,
    pub sync_attempts: u32,
    pub last_sync_attempt_time: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub needs_attention: bool,
}

/// Camera region of interest in device pixel coordinates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalibrationRoi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CalibrationRoi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("roi width and height must be > 0"));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// True when the rectangle lies entirely inside a `frame_width` x `frame_height` image.
    pub fn fits(&self, frame_width: u32, frame_height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= frame_width && b <= frame_height)
    }
}

// -------------------- Retry Backoff --------------------

/// Exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
