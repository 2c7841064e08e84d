use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::matching::Aggregation;
use crate::CalibrationRoi;

const DEFAULT_CONFIG_PATH: &str = "/etc/checador/config.toml";
const DEFAULT_DEVICE_ID: &str = "CHECADOR-001";
const DEFAULT_DATA_DIR: &str = "/var/lib/checador";
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 15;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_UNHEALTHY_AFTER_TIMEOUTS: u32 = 5;
const DEFAULT_MINDTCT: &str = "/usr/local/bin/mindtct";
const DEFAULT_BOZORTH3: &str = "/usr/local/bin/bozorth3";
const DEFAULT_MATCH_THRESHOLD: i32 = 40;
const DEFAULT_AMBIGUITY_MARGIN: i32 = 5;
const DEFAULT_MIN_QUALITY: i32 = 20;
const DEFAULT_REQUIRED_TEMPLATES: u32 = 3;
const DEFAULT_EXTRACT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MATCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_ANTIBOUNCE_SECS: u64 = 10;
const DEFAULT_COOLDOWN_SECS: u64 = 3;
const DEFAULT_DIFFERENCE_THRESHOLD: f32 = 0.02;
const DEFAULT_STABLE_FRAMES: usize = 5;
const DEFAULT_ENROLLMENT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 5;
/// Upper bound for any sync wait (interval or retry cap): one week.
const MAX_SYNC_WAIT_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_RETRY_BACKOFF_BASE_SECS: u64 = 2;
const DEFAULT_RETRY_MAX_INTERVAL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Deserialize, Default)]
struct KioskConfigFile {
    app: Option<AppConfigFile>,
    camera: Option<CameraConfigFile>,
    fingerprint: Option<FingerprintConfigFile>,
    timeclock: Option<TimeclockConfigFile>,
    autopunch: Option<AutopunchConfigFile>,
    enrollment: Option<EnrollmentConfigFile>,
    server: Option<ServerConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    device_id: Option<String>,
    data_dir: Option<PathBuf>,
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    roi_x: Option<u32>,
    roi_y: Option<u32>,
    roi_width: Option<u32>,
    roi_height: Option<u32>,
    read_timeout_ms: Option<u64>,
    unhealthy_after_timeouts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FingerprintConfigFile {
    backend: Option<String>,
    nbis_mindtct: Option<PathBuf>,
    nbis_bozorth3: Option<PathBuf>,
    match_threshold: Option<i32>,
    ambiguity_margin: Option<i32>,
    aggregation: Option<String>,
    min_quality_score: Option<i32>,
    required_templates: Option<u32>,
    // Accepted for compatibility with older config files.
    enrollment_samples: Option<u32>,
    extract_timeout_ms: Option<u64>,
    match_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeclockConfigFile {
    antibounce_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AutopunchConfigFile {
    enabled: Option<bool>,
    cooldown_seconds: Option<u64>,
    difference_threshold: Option<f32>,
    stable_frames: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EnrollmentConfigFile {
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    enabled: Option<bool>,
    url: Option<String>,
    api_key: Option<String>,
    interval_minutes: Option<u64>,
    retry_backoff_base_secs: Option<u64>,
    retry_max_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub device_id: String,
    pub data_dir: PathBuf,
    pub db_path: String,
    pub camera: CameraSettings,
    pub fingerprint: FingerprintSettings,
    pub antibounce: Duration,
    pub autopunch: AutopunchSettings,
    pub enrollment_timeout: Duration,
    pub server: ServerSettings,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub roi: CalibrationRoi,
    pub read_timeout: Duration,
    pub unhealthy_after_timeouts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolkitBackend {
    Nbis,
    Stub,
}

#[derive(Debug, Clone)]
pub struct FingerprintSettings {
    pub backend: ToolkitBackend,
    pub mindtct: PathBuf,
    pub bozorth3: PathBuf,
    pub match_threshold: i32,
    pub ambiguity_margin: i32,
    pub aggregation: Aggregation,
    pub min_quality_score: i32,
    pub required_templates: u32,
    pub extract_timeout: Duration,
    pub match_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AutopunchSettings {
    pub enabled: bool,
    pub cooldown: Duration,
    pub difference_threshold: f32,
    pub stable_frames: usize,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    pub interval: Duration,
    pub retry_backoff_base: Duration,
    pub retry_max_interval: Duration,
    pub request_timeout: Duration,
}

impl KioskConfig {
    /// Load from `CHECADOR_CONFIG` (or the default path if it exists), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CHECADOR_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    read_config_file(default_path)?
                } else {
                    log::warn!(
                        "no config file at {}; using built-in defaults",
                        DEFAULT_CONFIG_PATH
                    );
                    KioskConfigFile::default()
                }
            }
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: KioskConfigFile = toml::from_str(raw).context("invalid config toml")?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KioskConfigFile) -> Result<Self> {
        let app = file.app.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let fp = file.fingerprint.unwrap_or_default();
        let autopunch = file.autopunch.unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let api = file.api.unwrap_or_default();

        let data_dir = app
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let db_path = app
            .db_path
            .unwrap_or_else(|| data_dir.join("checador.db").to_string_lossy().to_string());

        let width = camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH);
        let height = camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT);
        let roi = CalibrationRoi::new(
            camera.roi_x.unwrap_or(0),
            camera.roi_y.unwrap_or(0),
            camera.roi_width.unwrap_or(width),
            camera.roi_height.unwrap_or(height),
        )
        .context("invalid camera roi")?;

        let backend = match fp.backend.as_deref().unwrap_or("nbis") {
            "nbis" => ToolkitBackend::Nbis,
            "stub" => ToolkitBackend::Stub,
            other => {
                return Err(anyhow!(
                    "unknown fingerprint backend '{}'; expected nbis or stub",
                    other
                ))
            }
        };
        let aggregation = match fp.aggregation.as_deref().unwrap_or("best") {
            "best" => Aggregation::Best,
            "mean" => Aggregation::Mean,
            other => {
                return Err(anyhow!(
                    "unknown aggregation '{}'; expected best or mean",
                    other
                ))
            }
        };

        Ok(Self {
            device_id: app
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            data_dir,
            db_path,
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                width,
                height,
                fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
                roi,
                read_timeout: Duration::from_millis(
                    camera.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
                unhealthy_after_timeouts: camera
                    .unhealthy_after_timeouts
                    .unwrap_or(DEFAULT_UNHEALTHY_AFTER_TIMEOUTS),
            },
            fingerprint: FingerprintSettings {
                backend,
                mindtct: fp
                    .nbis_mindtct
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MINDTCT)),
                bozorth3: fp
                    .nbis_bozorth3
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_BOZORTH3)),
                match_threshold: fp.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD),
                ambiguity_margin: fp.ambiguity_margin.unwrap_or(DEFAULT_AMBIGUITY_MARGIN),
                aggregation,
                min_quality_score: fp.min_quality_score.unwrap_or(DEFAULT_MIN_QUALITY),
                required_templates: fp
                    .required_templates
                    .or(fp.enrollment_samples)
                    .unwrap_or(DEFAULT_REQUIRED_TEMPLATES),
                extract_timeout: Duration::from_millis(
                    fp.extract_timeout_ms.unwrap_or(DEFAULT_EXTRACT_TIMEOUT_MS),
                ),
                match_timeout: Duration::from_millis(
                    fp.match_timeout_ms.unwrap_or(DEFAULT_MATCH_TIMEOUT_MS),
                ),
            },
            antibounce: Duration::from_secs(
                file.timeclock
                    .and_then(|t| t.antibounce_seconds)
                    .unwrap_or(DEFAULT_ANTIBOUNCE_SECS),
            ),
            autopunch: AutopunchSettings {
                enabled: autopunch.enabled.unwrap_or(true),
                cooldown: Duration::from_secs(
                    autopunch.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                difference_threshold: autopunch
                    .difference_threshold
                    .unwrap_or(DEFAULT_DIFFERENCE_THRESHOLD),
                stable_frames: autopunch.stable_frames.unwrap_or(DEFAULT_STABLE_FRAMES),
            },
            enrollment_timeout: Duration::from_secs(
                file.enrollment
                    .and_then(|e| e.timeout_seconds)
                    .unwrap_or(DEFAULT_ENROLLMENT_TIMEOUT_SECS),
            ),
            server: ServerSettings {
                enabled: server.enabled.unwrap_or(false),
                url: server.url.unwrap_or_default(),
                api_key: server.api_key.unwrap_or_default(),
                interval: Duration::from_secs(sync_interval_secs(server.interval_minutes)?),
                retry_backoff_base: Duration::from_secs(
                    server
                        .retry_backoff_base_secs
                        .unwrap_or(DEFAULT_RETRY_BACKOFF_BASE_SECS),
                ),
                retry_max_interval: Duration::from_secs(
                    server
                        .retry_max_interval_secs
                        .unwrap_or(DEFAULT_RETRY_MAX_INTERVAL_SECS),
                ),
                request_timeout: Duration::from_secs(
                    server
                        .request_timeout_secs
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                ),
            },
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token_path: api.token_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device_id) = std::env::var("CHECADOR_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(device) = std::env::var("CHECADOR_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(db_path) = std::env::var("CHECADOR_DB_PATH") {
            if !db_path.trim().is_empty() {
                self.db_path = db_path;
            }
        }
        if let Ok(url) = std::env::var("CHECADOR_SERVER_URL") {
            if !url.trim().is_empty() {
                self.server.url = url;
                self.server.enabled = true;
            }
        }
        if let Ok(key) = std::env::var("CHECADOR_API_KEY") {
            if !key.trim().is_empty() {
                self.server.api_key = key;
            }
        }
        if let Ok(addr) = std::env::var("CHECADOR_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(secs) = std::env::var("CHECADOR_ANTIBOUNCE_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("CHECADOR_ANTIBOUNCE_SECS must be an integer number of seconds")
            })?;
            self.antibounce = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Reject thresholds and settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device_id must not be empty"));
        }
        let fp = &self.fingerprint;
        if fp.match_threshold <= 0 {
            return Err(anyhow!("match_threshold must be greater than zero"));
        }
        if fp.ambiguity_margin < 0 {
            return Err(anyhow!("ambiguity_margin must not be negative"));
        }
        if fp.min_quality_score < 0 {
            return Err(anyhow!("min_quality_score must not be negative"));
        }
        if fp.required_templates == 0 {
            return Err(anyhow!("required_templates must be at least 1"));
        }
        if fp.extract_timeout.is_zero() || fp.match_timeout.is_zero() {
            return Err(anyhow!("capability timeouts must be greater than zero"));
        }
        let ap = &self.autopunch;
        if !(ap.difference_threshold > 0.0 && ap.difference_threshold <= 1.0) {
            return Err(anyhow!("difference_threshold must be in (0, 1]"));
        }
        if ap.stable_frames < 2 {
            return Err(anyhow!("stable_frames must be at least 2"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if self.camera.read_timeout.is_zero() {
            return Err(anyhow!("camera read timeout must be greater than zero"));
        }
        if self.camera.unhealthy_after_timeouts == 0 {
            return Err(anyhow!("unhealthy_after_timeouts must be at least 1"));
        }
        if !self.camera.roi.fits(self.camera.width, self.camera.height) {
            log::warn!(
                "configured roi {:?} exceeds {}x{}; full frames will be used",
                self.camera.roi,
                self.camera.width,
                self.camera.height
            );
        }
        if self.enrollment_timeout.is_zero() {
            return Err(anyhow!("enrollment timeout must be greater than zero"));
        }
        if self.server.enabled {
            if self.server.url.trim().is_empty() {
                return Err(anyhow!("server sync enabled but server.url is empty"));
            }
            let url = url::Url::parse(&self.server.url)
                .map_err(|e| anyhow!("invalid server.url '{}': {}", self.server.url, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("server.url must use http or https"));
            }
            if self.server.interval.is_zero() {
                return Err(anyhow!("server.interval_minutes must be greater than zero"));
            }
            if self.server.retry_backoff_base.is_zero() {
                return Err(anyhow!("server.retry_backoff_base_secs must be greater than zero"));
            }
            let max_wait = Duration::from_secs(MAX_SYNC_WAIT_SECS);
            if self.server.interval > max_wait || self.server.retry_max_interval > max_wait {
                return Err(anyhow!(
                    "server sync interval and retry cap must not exceed {} seconds",
                    MAX_SYNC_WAIT_SECS
                ));
            }
        }
        Ok(())
    }

    /// Scratch directory for capability exchange files (images, templates).
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("temp")
    }
}

fn sync_interval_secs(minutes: Option<u64>) -> Result<u64> {
    let minutes = minutes.unwrap_or(DEFAULT_SYNC_INTERVAL_MINUTES);
    minutes
        .checked_mul(60)
        .ok_or_else(|| anyhow!("server.interval_minutes {} is out of range", minutes))
}

fn read_config_file(path: &Path) -> Result<KioskConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() -> Result<()> {
        let cfg = KioskConfig::from_toml_str("")?;
        assert_eq!(cfg.device_id, "CHECADOR-001");
        assert_eq!(cfg.fingerprint.match_threshold, 40);
        assert_eq!(cfg.fingerprint.min_quality_score, 20);
        assert_eq!(cfg.fingerprint.required_templates, 3);
        assert_eq!(cfg.fingerprint.aggregation, Aggregation::Best);
        assert_eq!(cfg.antibounce, Duration::from_secs(10));
        assert!(!cfg.server.enabled);
        assert_eq!(cfg.camera.roi, CalibrationRoi::new(0, 0, 640, 480)?);
        Ok(())
    }

    #[test]
    fn legacy_enrollment_samples_key_is_honored() -> Result<()> {
        let cfg = KioskConfig::from_toml_str("[fingerprint]\nenrollment_samples = 5\n")?;
        assert_eq!(cfg.fingerprint.required_templates, 5);
        Ok(())
    }

    #[test]
    fn rejects_invalid_thresholds() {
        assert!(KioskConfig::from_toml_str("[fingerprint]\nmatch_threshold = 0\n").is_err());
        assert!(KioskConfig::from_toml_str("[fingerprint]\nrequired_templates = 0\n").is_err());
        assert!(KioskConfig::from_toml_str("[autopunch]\nstable_frames = 1\n").is_err());
        assert!(
            KioskConfig::from_toml_str("[autopunch]\ndifference_threshold = 1.5\n").is_err()
        );
        assert!(KioskConfig::from_toml_str("[fingerprint]\naggregation = \"median\"\n").is_err());
    }

    #[test]
    fn sync_requires_valid_url() {
        assert!(KioskConfig::from_toml_str("[server]\nenabled = true\n").is_err());
        assert!(
            KioskConfig::from_toml_str("[server]\nenabled = true\nurl = \"ftp://x\"\n").is_err()
        );
        assert!(KioskConfig::from_toml_str(
            "[server]\nenabled = true\nurl = \"https://hr.example.com/api\"\n"
        )
        .is_ok());
    }

    #[test]
    fn oversized_sync_intervals_are_rejected() {
        let huge = format!(
            "[server]\nenabled = true\nurl = \"https://hr.example.com\"\ninterval_minutes = {}\n",
            i64::MAX
        );
        assert!(KioskConfig::from_toml_str(&huge).is_err());
        assert!(KioskConfig::from_toml_str(
            "[server]\nenabled = true\nurl = \"https://hr.example.com\"\ninterval_minutes = 20160\n"
        )
        .is_err());
        assert!(KioskConfig::from_toml_str(
            "[server]\nenabled = true\nurl = \"https://hr.example.com\"\nretry_max_interval_secs = 99999999\n"
        )
        .is_err());
        assert!(sync_interval_secs(Some(u64::MAX)).is_err());
    }
}
