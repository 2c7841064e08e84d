//! Loopback control API for the kiosk daemon.
//!
//! Plain HTTP/1.1 over std `TcpListener`, one request per connection. Every
//! endpoint except `/health` requires the bearer capability token generated
//! at startup (32 random bytes, hex). The token is written 0600 to the
//! configured token path so local admin tools can pick it up.

use crate::enrollment::EnrollmentRequest;
use crate::kiosk::Kiosk;
use crate::CalibrationRoi;
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            token_path: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Process-lifetime bearer token.
#[derive(Clone)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        // Fold every byte so the comparison time does not depend on the first mismatch.
        let diff = presented
            .iter()
            .zip(self.token.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    kiosk: Arc<Kiosk>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, kiosk: Arc<Kiosk>) -> Self {
        Self { cfg, kiosk }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        if !addr.ip().is_loopback() {
            log::warn!("control api listening on non-loopback address {}", addr);
        }
        listener.set_nonblocking(true)?;

        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let kiosk = self.kiosk;
        let token_path = self.cfg.token_path.clone();
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &kiosk, &capability, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    kiosk: &Kiosk,
    capability: &CapabilityToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, kiosk, capability) {
                    log::warn!("control api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct EnrollBody {
    employee_code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct AutopunchBody {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct CalibrationBody {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

fn handle_connection(mut stream: TcpStream, kiosk: &Kiosk, capability: &CapabilityToken) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    let route = (request.method.as_str(), request.path.as_str());
    match route {
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
            return Ok(());
        }
        ("GET", "/status")
        | ("POST", "/enroll")
        | ("POST", "/enroll/cancel")
        | ("POST", "/autopunch")
        | ("POST", "/sync")
        | ("POST", "/calibration") => {}
        (_, "/health" | "/status" | "/enroll" | "/enroll/cancel" | "/autopunch" | "/sync"
        | "/calibration") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
            return Ok(());
        }
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    }

    if request.has_query_token() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }

    let token = match request.bearer_token() {
        Some(token) => token,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if let Err(err) = capability.validate(&token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    let (status, body) = match dispatch(kiosk, &request) {
        Ok(reply) => reply,
        Err(err) => {
            log::warn!("{} {} failed: {:#}", request.method, request.path, err);
            (500, json!({ "error": err.to_string() }))
        }
    };
    let payload = serde_json::to_vec(&body)?;
    write_response(&mut stream, status, "application/json", &payload)?;
    Ok(())
}

/// Authorized routes. Operator mistakes map to 4xx with the reason in the body.
fn dispatch(kiosk: &Kiosk, request: &HttpRequest) -> Result<(u16, serde_json::Value)> {
    match request.path.as_str() {
        "/status" => Ok((200, serde_json::to_value(kiosk.status_report()?)?)),
        "/enroll" => {
            let body: EnrollBody = match request.json() {
                Ok(body) => body,
                Err(err) => return Ok((400, json!({ "error": err.to_string() }))),
            };
            let name = body
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| body.employee_code.clone());
            let enrollment = EnrollmentRequest {
                employee_code: body.employee_code,
                name,
                replace: body.replace,
            };
            match kiosk.start_enrollment(enrollment) {
                Ok(started) => Ok((
                    202,
                    json!({
                        "status": "enrolling",
                        "employee_id": started.employee_id,
                        "employee_code": started.employee_code,
                    }),
                )),
                Err(err) => Ok((409, json!({ "error": err.to_string() }))),
            }
        }
        "/enroll/cancel" => Ok((200, json!({ "cancelled": kiosk.cancel_enrollment()? }))),
        "/autopunch" => {
            let body: AutopunchBody = match request.json() {
                Ok(body) => body,
                Err(err) => return Ok((400, json!({ "error": err.to_string() }))),
            };
            kiosk.set_autopunch(body.enabled);
            Ok((200, json!({ "enabled": kiosk.autopunch_enabled() })))
        }
        "/sync" => match kiosk.trigger_sync() {
            Ok(()) => Ok((202, json!({ "status": "triggered" }))),
            Err(err) => Ok((409, json!({ "error": err.to_string() }))),
        },
        "/calibration" => {
            let body: CalibrationBody = match request.json() {
                Ok(body) => body,
                Err(err) => return Ok((400, json!({ "error": err.to_string() }))),
            };
            let roi = match CalibrationRoi::new(body.x, body.y, body.width, body.height) {
                Ok(roi) => roi,
                Err(err) => return Ok((400, json!({ "error": err.to_string() }))),
            };
            match kiosk.recalibrate(roi) {
                Ok(()) => Ok((200, json!({ "roi": roi }))),
                Err(err) => Ok((400, json!({ "error": err.to_string() }))),
            }
        }
        other => Err(anyhow!("unrouted path {}", other)),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = data[header_end..header_end + content_length].to_vec();

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Err(anyhow!("request body required"));
        }
        serde_json::from_slice(&self.body).map_err(|e| anyhow!("invalid request body: {}", e))
    }
}

pub fn write_token_file(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation; tighten a file left by an older run
    // before the token lands in it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(format!("{token}\n").as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read a token written by `write_token_file`.
pub fn read_token_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read api token {}: {}", path.display(), e))?;
    let token = raw.trim().to_string();
    parse_hex32(&token)?;
    Ok(token)
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_validation_rejects_other_tokens() -> Result<()> {
        let token = CapabilityToken::generate();
        token.validate(&token.token_hex())?;
        let other = CapabilityToken::generate();
        assert!(token.validate(&other.token_hex()).is_err());
        assert!(token.validate("abcd").is_err());
        assert!(token.validate("not hex").is_err());
        Ok(())
    }

    #[test]
    fn token_file_round_trips_with_private_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run").join("api.token");
        let token = CapabilityToken::generate().token_hex();
        write_token_file(&path, &token)?;
        assert_eq!(read_token_file(&path)?, token);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn token_file_left_world_readable_is_tightened() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("api.token");
        std::fs::write(&path, "stale token from an older run\n")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;

        let token = CapabilityToken::generate().token_hex();
        write_token_file(&path, &token)?;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(read_token_file(&path)?, token);
        Ok(())
    }
}
