//! checador_admin - operator tool for the time clock
//!
//! Live actions (status, enrollment, auto-punch, sync, calibration) go through
//! the daemon's control API using the token file it writes. Record keeping
//! (users, punches, requeue, purge) works on the database directly so it is
//! available while the daemon is stopped.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use checador::api::read_token_file;
use checador::ui::Ui;
use checador::{FrameSource, KioskConfig, Store, Toolkit};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml (default /etc/checador/config.toml).
    #[arg(long, env = "CHECADOR_CONFIG")]
    config: Option<PathBuf>,
    /// Control API token file (defaults to api.token_path from the config).
    #[arg(long, env = "CHECADOR_API_TOKEN_PATH")]
    token_path: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show kiosk, camera and sync status.
    Status,
    /// Enroll (or re-enroll) an employee's fingerprint.
    Enroll {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: Option<String>,
        /// Replace the templates of an already enrolled employee.
        #[arg(long)]
        replace: bool,
        /// Return immediately instead of following progress.
        #[arg(long)]
        no_wait: bool,
    },
    /// Cancel the running enrollment.
    CancelEnroll,
    /// Turn automatic punching on or off.
    Autopunch {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Ask the sync worker for an immediate pass.
    SyncNow,
    /// Set the camera region of interest.
    Calibrate {
        #[arg(long)]
        x: u32,
        #[arg(long)]
        y: u32,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
    },
    /// List employees.
    Users,
    /// Deactivate an employee; their templates stop matching.
    Deactivate { code: String },
    /// Show recent punches.
    Punches {
        #[arg(long)]
        employee: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Put failed or withheld punches back in the sync queue (all when no ids given).
    Requeue { ids: Vec<i64> },
    /// Delete synced punches older than N days (each employee's latest is kept).
    Purge {
        #[arg(long, default_value_t = 90)]
        older_than_days: i64,
    },
    /// Open the camera, grab one frame and check the ROI. Stop the daemon first.
    CameraTest,
    /// Load and validate the configuration and toolkit.
    CheckConfig,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::detect(Some(&args.ui));

    let config = {
        let _stage = ui.stage("Load config");
        KioskConfig::load_from(args.config.as_deref())?
    };

    match &args.command {
        Command::Status => {
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            print_json(&api.get("/status")?)
        }
        Command::Enroll {
            code,
            name,
            replace,
            no_wait,
        } => {
            checador::validate_employee_code(code)?;
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            let started = api.post(
                "/enroll",
                json!({ "employee_code": code, "name": name, "replace": replace }),
            )?;
            if *no_wait {
                return print_json(&started);
            }
            follow_enrollment(&api, &ui, code, &config)
        }
        Command::CancelEnroll => {
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            print_json(&api.post("/enroll/cancel", json!({}))?)
        }
        Command::Autopunch { state } => {
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            let enabled = matches!(state, Toggle::On);
            print_json(&api.post("/autopunch", json!({ "enabled": enabled }))?)
        }
        Command::SyncNow => {
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            print_json(&api.post("/sync", json!({}))?)
        }
        Command::Calibrate {
            x,
            y,
            width,
            height,
        } => {
            let api = ApiClient::connect(&config, args.token_path.as_ref())?;
            print_json(&api.post(
                "/calibration",
                json!({ "x": x, "y": y, "width": width, "height": height }),
            )?)
        }
        Command::Users => {
            let store = Store::open(&config.db_path)?;
            let employees = store.list_employees()?;
            println!(
                "{:<6} {:<16} {:<24} {:<8} {:<9} {:<5}",
                "ID", "CODE", "NAME", "ACTIVE", "TEMPLATES", "LAST"
            );
            for row in employees {
                let e = &row.employee;
                println!(
                    "{:<6} {:<16} {:<24} {:<8} {:<9} {:<5}",
                    e.id,
                    e.employee_code,
                    e.name,
                    if e.active { "yes" } else { "no" },
                    row.template_count,
                    e.last_punch_direction.as_str()
                );
            }
            Ok(())
        }
        Command::Deactivate { code } => {
            let mut store = Store::open(&config.db_path)?;
            if !store.deactivate_employee(code)? {
                return Err(anyhow!("employee {} not found", code));
            }
            println!("deactivated {}", code);
            Ok(())
        }
        Command::Punches { employee, limit } => {
            let store = Store::open(&config.db_path)?;
            for punch in store.recent_punches(employee.as_deref(), *limit)? {
                println!(
                    "{:<6} {:<16} {:<4} {} score={:<4} {}{}",
                    punch.id,
                    punch.employee_code,
                    punch.punch_type.as_str(),
                    punch.timestamp_local.to_rfc3339(),
                    punch.match_score,
                    punch.sync_status.as_str(),
                    if punch.needs_attention {
                        " (needs attention)"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        Command::Requeue { ids } => {
            let mut store = Store::open(&config.db_path)?;
            let count = store.requeue(ids)?;
            println!("requeued {} punches", count);
            Ok(())
        }
        Command::Purge { older_than_days } => {
            if *older_than_days < 0 {
                return Err(anyhow!("--older-than-days must not be negative"));
            }
            let mut store = Store::open(&config.db_path)?;
            let before = Utc::now() - ChronoDuration::days(*older_than_days);
            let removed = store.purge_synced(before)?;
            println!("purged {} synced punches", removed);
            Ok(())
        }
        Command::CameraTest => {
            let diagnostics = {
                let _stage = ui.stage("Camera test");
                let store = Store::open(&config.db_path)?;
                let roi = store.calibration()?.unwrap_or(config.camera.roi);
                FrameSource::from_config(&config.camera, roi)?.camera_test()
            };
            print_json(&serde_json::to_value(&diagnostics)?)?;
            if diagnostics.error.is_some() {
                return Err(anyhow!("camera test failed"));
            }
            Ok(())
        }
        Command::CheckConfig => {
            {
                let _stage = ui.stage("Verify fingerprint toolkit");
                Toolkit::from_settings(&config.fingerprint, &config.temp_dir())?;
            }
            println!("device_id       {}", config.device_id);
            println!("database        {}", config.db_path);
            println!("camera          {}", config.camera.device);
            println!(
                "match           threshold={} margin={} aggregation={:?}",
                config.fingerprint.match_threshold,
                config.fingerprint.ambiguity_margin,
                config.fingerprint.aggregation
            );
            println!(
                "enrollment      {} samples, min quality {}",
                config.fingerprint.required_templates, config.fingerprint.min_quality_score
            );
            println!("antibounce      {}s", config.antibounce.as_secs());
            println!(
                "sync            {}",
                if config.server.enabled {
                    config.server.url.as_str()
                } else {
                    "disabled"
                }
            );
            println!("config ok");
            Ok(())
        }
    }
}

fn follow_enrollment(api: &ApiClient, ui: &Ui, code: &str, config: &KioskConfig) -> Result<()> {
    let mut bar = ui.samples(code, config.fingerprint.required_templates);
    // Allow for camera hand-over on top of the session timeout.
    let deadline = Instant::now() + config.enrollment_timeout + Duration::from_secs(10);
    loop {
        std::thread::sleep(Duration::from_millis(300));
        let status = api.get("/status")?;
        if let Some(sample) = status["kiosk"]["sample"].as_u64() {
            bar.update(sample as u32);
        }
        if status["enrolling"].is_null() {
            let outcome = status["last_enrollment"]["outcome"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            bar.finish(&outcome);
            if outcome != "completed" {
                if let Some(message) = status["kiosk"]["message"].as_str() {
                    eprintln!("{}", message);
                }
                return Err(anyhow!("enrollment for {} ended: {}", code, outcome));
            }
            return print_json(&status["last_enrollment"]);
        }
        if Instant::now() >= deadline {
            bar.finish("no response");
            return Err(anyhow!("gave up waiting for enrollment of {}", code));
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct ApiClient {
    agent: ureq::Agent,
    base: String,
    token: String,
}

impl ApiClient {
    fn connect(config: &KioskConfig, token_path: Option<&PathBuf>) -> Result<Self> {
        let path = token_path
            .or(config.api_token_path.as_ref())
            .ok_or_else(|| anyhow!("api token path not configured; pass --token-path"))?;
        let token = read_token_file(path)?;
        Ok(Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            base: format!("http://{}", config.api_addr),
            token,
        })
    }

    fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .agent
            .get(&format!("{}{}", self.base, path))
            .set("Authorization", &format!("Bearer {}", self.token))
            .call();
        Self::decode(path, response)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .agent
            .post(&format!("{}{}", self.base, path))
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body);
        Self::decode(path, response)
    }

    fn decode(path: &str, response: Result<ureq::Response, ureq::Error>) -> Result<Value> {
        match response {
            Ok(response) => response
                .into_json::<Value>()
                .with_context(|| format!("invalid response from {}", path)),
            Err(ureq::Error::Status(code, response)) => {
                let body: Value = response.into_json().unwrap_or(Value::Null);
                let reason = body["error"].as_str().unwrap_or("request failed");
                Err(anyhow!("{} returned {}: {}", path, code, reason))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!(
                "cannot reach checadord control api ({}); is the daemon running?",
                err
            )),
        }
    }
}
