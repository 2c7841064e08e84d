//! Durable punch forwarding.
//!
//! The queue is the punches table itself: PENDING and FAILED rows are
//! submitted oldest first in batches. The worker runs on its own thread with
//! its own SQLite connection and talks to the capture side only through the
//! database. Nothing is ever dropped; a punch leaves the queue only when the
//! server acknowledges it, or is withheld for an operator after a permanent
//! rejection.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ServerSettings;
use crate::store::{Store, SyncCounts};
use crate::{Backoff, Punch, PunchType};

pub const BATCH_SIZE: usize = 100;
const MAX_ERROR_BODY: usize = 200;

// ---- Wire format ----

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PunchBatch {
    pub device_id: String,
    pub punches: Vec<PunchRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PunchRecord {
    /// Idempotency key; stable across retries.
    pub punch_id: String,
    pub employee_code: String,
    pub timestamp_utc: String,
    pub timestamp_local: String,
    pub punch_type: PunchType,
    pub match_score: i32,
}

impl From<&Punch> for PunchRecord {
    fn from(punch: &Punch) -> Self {
        Self {
            punch_id: punch.punch_uid.clone(),
            employee_code: punch.employee_code.clone(),
            timestamp_utc: punch.timestamp_utc.to_rfc3339(),
            timestamp_local: punch.timestamp_local.to_rfc3339(),
            punch_type: punch.punch_type,
            match_score: punch.match_score,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    success: bool,
}

// ---- Client ----

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Worth retrying unchanged: transport errors, 5xx, 408, 429, auth, odd bodies.
    Transient(String),
    /// The server rejected the batch itself; retrying unchanged cannot succeed.
    Permanent(String),
}

pub trait SyncClient: Send {
    fn submit(&self, batch: &PunchBatch) -> SubmitOutcome;
}

pub struct HttpSyncClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

impl HttpSyncClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let parsed =
            url::Url::parse(base_url).with_context(|| format!("invalid server url {}", base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("server url must use http or https"));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint: format!("{}/punches", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_settings(server: &ServerSettings) -> Result<Self> {
        Self::new(&server.url, &server.api_key, server.request_timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SyncClient for HttpSyncClient {
    fn submit(&self, batch: &PunchBatch) -> SubmitOutcome {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(batch);
        match response {
            Ok(response) => match response.into_json::<SyncResponse>() {
                Ok(body) if body.success => SubmitOutcome::Accepted,
                Ok(_) => SubmitOutcome::Transient("server reported success=false".to_string()),
                Err(err) => SubmitOutcome::Transient(format!("unexpected response body: {}", err)),
            },
            Err(ureq::Error::Status(code, response)) => {
                let body = truncate_chars(&response.into_string().unwrap_or_default(), MAX_ERROR_BODY);
                let message = format!("server returned {}: {}", code, body.trim());
                if is_transient_status(code) {
                    SubmitOutcome::Transient(message)
                } else {
                    SubmitOutcome::Permanent(message)
                }
            }
            Err(ureq::Error::Transport(err)) => SubmitOutcome::Transient(err.to_string()),
        }
    }
}

/// At most `max` characters; servers may answer in any language.
fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// 401/403 mean the kiosk credentials are wrong, not the punches; they retry.
pub fn is_transient_status(code: u16) -> bool {
    code >= 500 || matches!(code, 401 | 403 | 408 | 429)
}

// ---- Queue ----

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub enabled: bool,
    pub url: String,
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub batch_size: usize,
}

impl SyncSettings {
    pub fn from_server(server: &ServerSettings) -> Self {
        Self {
            enabled: server.enabled,
            url: server.url.clone(),
            interval: server.interval,
            backoff_base: server.retry_backoff_base,
            backoff_max: server.retry_max_interval,
            batch_size: BATCH_SIZE,
        }
    }
}

/// Worker bookkeeping, shared with the control surface.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncState {
    pub running: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncStatusReport {
    pub enabled: bool,
    pub url: Option<String>,
    #[serde(flatten)]
    pub counts: SyncCounts,
    #[serde(flatten)]
    pub state: SyncState,
}

impl SyncStatusReport {
    pub fn compose(settings: &SyncSettings, store: &Store, state: SyncState) -> Result<Self> {
        let mut state = state;
        if state.last_error.is_none() {
            state.last_error = store.last_sync_error()?;
        }
        Ok(Self {
            enabled: settings.enabled,
            url: settings.enabled.then(|| settings.url.clone()),
            counts: store.sync_counts()?,
            state,
        })
    }
}

/// Result of one `sync_now` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub batches: usize,
    pub synced: usize,
    pub failed: usize,
    pub withheld: usize,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct SyncQueue {
    store: Store,
    client: Box<dyn SyncClient>,
    settings: SyncSettings,
    device_id: String,
    state: Arc<Mutex<SyncState>>,
}

impl SyncQueue {
    /// Opens a dedicated connection to `db_path`.
    pub fn new(
        db_path: &str,
        client: Box<dyn SyncClient>,
        settings: SyncSettings,
        device_id: &str,
    ) -> Result<Self> {
        let store = Store::open(db_path).context("open sync queue connection")?;
        Ok(Self {
            store,
            client,
            settings,
            device_id: device_id.to_string(),
            state: Arc::new(Mutex::new(SyncState::default())),
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Result<SyncStatusReport> {
        SyncStatusReport::compose(&self.settings, &self.store, self.state())
    }

    /// Submit pending punches batch by batch until the queue is drained or a
    /// transient failure stops the pass.
    pub fn sync_now(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        loop {
            let punches = self.store.pending_punches(self.settings.batch_size)?;
            if punches.is_empty() {
                break;
            }
            let ids: Vec<i64> = punches.iter().map(|p| p.id).collect();
            let batch = PunchBatch {
                device_id: self.device_id.clone(),
                punches: punches.iter().map(PunchRecord::from).collect(),
            };
            log::info!("syncing {} punches to server", ids.len());
            report.batches += 1;
            let attempt_at = Utc::now();
            self.update_state(|state| state.last_attempt = Some(attempt_at));

            match self.client.submit(&batch) {
                SubmitOutcome::Accepted => {
                    report.synced += self.store.mark_synced(&ids, attempt_at)?;
                    log::info!("successfully synced {} punches", ids.len());
                }
                SubmitOutcome::Transient(err) => {
                    report.failed += self.store.mark_failed(&ids, attempt_at, &err, false)?;
                    log::warn!("sync failed: {}", err);
                    report.error = Some(err);
                    break;
                }
                SubmitOutcome::Permanent(err) => {
                    report.withheld += self.store.mark_failed(&ids, attempt_at, &err, true)?;
                    log::error!(
                        "sync rejected; {} punches need operator attention: {}",
                        ids.len(),
                        err
                    );
                    report.error = Some(err);
                }
            }
        }

        let finished = Utc::now();
        let error = report.error.clone();
        self.update_state(|state| match error {
            None => {
                state.last_success = Some(finished);
                state.last_error = None;
                state.consecutive_failures = 0;
            }
            Some(err) => {
                state.last_error = Some(err);
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        });
        Ok(report)
    }

    fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    /// Run the queue on a worker thread: once at start, then every interval,
    /// on demand, and with backoff after failures.
    pub fn spawn(self) -> Result<SyncHandle> {
        let (tx, rx) = mpsc::channel::<SyncCommand>();
        let state = self.state.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("sync-worker".to_string())
            .spawn(move || self.run_worker(rx, shutdown_thread))
            .context("spawn sync worker")?;
        Ok(SyncHandle {
            trigger: tx,
            shutdown,
            state,
            join: Some(join),
        })
    }

    fn run_worker(mut self, rx: mpsc::Receiver<SyncCommand>, shutdown: Arc<AtomicBool>) {
        log::info!("sync worker started ({})", self.settings.url);
        self.update_state(|state| state.running = true);
        let mut backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let mut next_run = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            let wait = next_run.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(SyncCommand::SyncNow) => {}
                Ok(SyncCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let delay = match self.sync_now() {
                Ok(report) if report.succeeded() => {
                    backoff.reset();
                    self.settings.interval
                }
                Ok(_) => backoff.next_delay(),
                Err(err) => {
                    log::error!("sync pass failed: {:#}", err);
                    self.update_state(|state| state.last_error = Some(err.to_string()));
                    backoff.next_delay()
                }
            };
            if backoff.failures() > 0 {
                log::warn!(
                    "sync retry in {:?} (attempt {})",
                    delay,
                    backoff.failures()
                );
            }
            next_run = Instant::now() + delay;
        }
        self.update_state(|state| state.running = false);
        log::info!("sync worker stopped");
    }
}

enum SyncCommand {
    SyncNow,
    Shutdown,
}

pub struct SyncHandle {
    trigger: mpsc::Sender<SyncCommand>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<SyncState>>,
    join: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Ask the worker for an immediate pass.
    pub fn trigger(&self) -> Result<()> {
        self.trigger
            .send(SyncCommand::SyncNow)
            .map_err(|_| anyhow!("sync worker is not running"))
    }

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.trigger.send(SyncCommand::Shutdown);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("sync worker thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::Candidate;
    use crate::punch::{PunchDecider, PunchDecision};
    use crate::{shared_memory_uri, SyncStatus};
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[derive(Clone, Default)]
    struct ScriptedClient {
        outcomes: Arc<Mutex<VecDeque<SubmitOutcome>>>,
        batches: Arc<Mutex<Vec<PunchBatch>>>,
    }

    impl ScriptedClient {
        fn with(outcomes: Vec<SubmitOutcome>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                batches: Arc::default(),
            }
        }

        fn batches(&self) -> Vec<PunchBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl SyncClient for ScriptedClient {
        fn submit(&self, batch: &PunchBatch) -> SubmitOutcome {
            self.batches.lock().unwrap().push(batch.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SubmitOutcome::Accepted)
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            enabled: true,
            url: "http://hr.invalid".to_string(),
            interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            batch_size: BATCH_SIZE,
        }
    }

    /// Keeps the shared in-memory database alive and returns its uri.
    fn seeded_store(punches: usize) -> Result<(Store, String)> {
        let uri = shared_memory_uri();
        let mut store = Store::open(&uri)?;
        let employee = store.create_employee("EMP001", "Ana", Utc::now())?;
        let candidate = Candidate {
            employee_id: employee.id,
            employee_code: employee.employee_code,
            name: employee.name,
            score: 55,
        };
        let decider = PunchDecider::new(Duration::ZERO, "CHECADOR-TEST")?;
        let start = Utc::now() - ChronoDuration::days(1);
        for i in 0..punches {
            let at = start + ChronoDuration::seconds(i as i64);
            match decider.on_identified(&mut store, &candidate, at)? {
                PunchDecision::Accepted(_) => {}
                other => return Err(anyhow!("unexpected decision {:?}", other)),
            }
        }
        Ok((store, uri))
    }

    #[test]
    fn transient_failure_retries_until_synced() -> Result<()> {
        let (store, uri) = seeded_store(3)?;
        let client = ScriptedClient::with(vec![SubmitOutcome::Transient(
            "server returned 503".to_string(),
        )]);
        let mut queue = SyncQueue::new(&uri, Box::new(client.clone()), settings(), "CHECADOR-TEST")?;

        let first = queue.sync_now()?;
        assert_eq!(first.failed, 3);
        assert!(!first.succeeded());
        let punches = store.recent_punches(None, 10)?;
        assert!(punches
            .iter()
            .all(|p| p.sync_status == SyncStatus::Failed && p.sync_attempts == 1));

        let second = queue.sync_now()?;
        assert!(second.succeeded());
        assert_eq!(second.synced, 3);
        assert_eq!(store.sync_counts()?.synced, 3);

        // Retried batch carries the same idempotency keys.
        let batches = client.batches();
        let keys = |b: &PunchBatch| b.punches.iter().map(|p| p.punch_id.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&batches[0]), keys(&batches[1]));
        Ok(())
    }

    #[test]
    fn permanent_rejection_is_withheld_until_requeued() -> Result<()> {
        let (mut store, uri) = seeded_store(2)?;
        let client = ScriptedClient::with(vec![SubmitOutcome::Permanent(
            "server returned 422: unknown employee".to_string(),
        )]);
        let mut queue = SyncQueue::new(&uri, Box::new(client.clone()), settings(), "CHECADOR-TEST")?;

        let report = queue.sync_now()?;
        assert_eq!(report.withheld, 2);
        // Later passes never submit or sync the withheld punches.
        let report = queue.sync_now()?;
        assert_eq!(report.batches, 0);
        assert_eq!(store.sync_counts()?.needs_attention, 2);
        assert_eq!(store.sync_counts()?.synced, 0);
        let status = queue.status()?;
        assert!(status.state.last_error.is_some());

        store.requeue(&[])?;
        let report = queue.sync_now()?;
        assert_eq!(report.synced, 2);
        Ok(())
    }

    #[test]
    fn batches_are_capped_and_oldest_first() -> Result<()> {
        let (_store, uri) = seeded_store(250)?;
        let client = ScriptedClient::default();
        let mut queue = SyncQueue::new(&uri, Box::new(client.clone()), settings(), "CHECADOR-TEST")?;
        let report = queue.sync_now()?;
        assert_eq!(report.synced, 250);
        let sizes: Vec<usize> = client.batches().iter().map(|b| b.punches.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let batches = client.batches();
        let first = &batches[0].punches;
        assert!(first
            .windows(2)
            .all(|w| w[0].timestamp_utc <= w[1].timestamp_utc));
        Ok(())
    }

    #[test]
    fn worker_syncs_on_start_and_stops() -> Result<()> {
        let (store, uri) = seeded_store(2)?;
        let client = ScriptedClient::default();
        let queue = SyncQueue::new(&uri, Box::new(client), settings(), "CHECADOR-TEST")?;
        let handle = queue.spawn()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.sync_counts()?.synced < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.sync_counts()?.synced, 2);
        handle.trigger()?;
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn worker_backs_off_and_retries_transient_failures() -> Result<()> {
        let (store, uri) = seeded_store(2)?;
        let client = ScriptedClient::with(vec![
            SubmitOutcome::Transient("server returned 503".to_string()),
            SubmitOutcome::Transient("server returned 502".to_string()),
        ]);
        let queue = SyncQueue::new(&uri, Box::new(client.clone()), settings(), "CHECADOR-TEST")?;
        let handle = queue.spawn()?;

        // No trigger: the retries come from the worker's own backoff.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = handle.state();
            if store.sync_counts()?.synced == 2 && state.last_success.is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "worker never retried: {:?}", state);
            std::thread::sleep(Duration::from_millis(5));
        }
        let state = handle.state();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert_eq!(client.batches().len(), 3);
        let punches = store.recent_punches(None, 10)?;
        assert!(punches.iter().all(|p| p.sync_attempts == 2));
        handle.stop()?;
        Ok(())
    }

    fn serve_once(
        status_line: &'static str,
        body: impl Into<String>,
    ) -> (String, std::thread::JoinHandle<String>) {
        let body: String = body.into();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                data.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&data).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if data.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&data).to_string()
        });
        (format!("http://{}", addr), join)
    }

    fn sample_batch() -> PunchBatch {
        PunchBatch {
            device_id: "CHECADOR-TEST".to_string(),
            punches: vec![PunchRecord {
                punch_id: "00ff".to_string(),
                employee_code: "EMP001".to_string(),
                timestamp_utc: "2024-03-04T08:00:00+00:00".to_string(),
                timestamp_local: "2024-03-04T02:00:00-06:00".to_string(),
                punch_type: PunchType::In,
                match_score: 55,
            }],
        }
    }

    #[test]
    fn http_client_posts_batch_with_bearer_key() -> Result<()> {
        let (url, server) = serve_once("HTTP/1.1 200 OK", r#"{"success":true}"#);
        let client = HttpSyncClient::new(&url, "secret-key", Duration::from_secs(5))?;
        assert_eq!(client.submit(&sample_batch()), SubmitOutcome::Accepted);
        let request = server.join().map_err(|_| anyhow!("server panicked"))?;
        assert!(request.starts_with("POST /punches "));
        assert!(request.contains("Bearer secret-key"));
        assert!(request.contains(r#""punch_id":"00ff""#));
        assert!(request.contains(r#""punch_type":"IN""#));
        Ok(())
    }

    #[test]
    fn http_client_classifies_failures() -> Result<()> {
        let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable", r#"{"error":"busy"}"#);
        let client = HttpSyncClient::new(&url, "k", Duration::from_secs(5))?;
        assert!(matches!(client.submit(&sample_batch()), SubmitOutcome::Transient(_)));
        server.join().map_err(|_| anyhow!("server panicked"))?;

        let (url, server) = serve_once("HTTP/1.1 422 Unprocessable Entity", r#"{"error":"bad"}"#);
        let client = HttpSyncClient::new(&url, "k", Duration::from_secs(5))?;
        assert!(matches!(client.submit(&sample_batch()), SubmitOutcome::Permanent(_)));
        server.join().map_err(|_| anyhow!("server panicked"))?;

        let (url, server) = serve_once("HTTP/1.1 200 OK", "not json");
        let client = HttpSyncClient::new(&url, "k", Duration::from_secs(5))?;
        assert!(matches!(client.submit(&sample_batch()), SubmitOutcome::Transient(_)));
        server.join().map_err(|_| anyhow!("server panicked"))?;
        Ok(())
    }

    #[test]
    fn non_ascii_error_bodies_are_truncated_on_char_boundaries() -> Result<()> {
        let body = format!("a{}", "é".repeat(150));
        let (url, server) = serve_once("HTTP/1.1 422 Unprocessable Entity", body);
        let client = HttpSyncClient::new(&url, "k", Duration::from_secs(5))?;
        match client.submit(&sample_batch()) {
            SubmitOutcome::Permanent(message) => {
                assert!(message.contains("422"));
                assert!(message.ends_with('é'));
            }
            other => panic!("expected permanent rejection, got {:?}", other),
        }
        server.join().map_err(|_| anyhow!("server panicked"))?;

        let text = "ñ".repeat(300);
        assert_eq!(truncate_chars(&text, MAX_ERROR_BODY).chars().count(), MAX_ERROR_BODY);
        Ok(())
    }

    #[test]
    fn transport_errors_are_transient() -> Result<()> {
        // Bind then drop to get a closed port.
        let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let client = HttpSyncClient::new(
            &format!("http://127.0.0.1:{}", port),
            "k",
            Duration::from_secs(2),
        )?;
        assert!(matches!(client.submit(&sample_batch()), SubmitOutcome::Transient(_)));
        Ok(())
    }

    #[test]
    fn status_codes_split_into_retry_classes() {
        for code in [500, 502, 503, 408, 429, 401, 403] {
            assert!(is_transient_status(code), "{}", code);
        }
        for code in [400, 404, 409, 422] {
            assert!(!is_transient_status(code), "{}", code);
        }
    }
}
