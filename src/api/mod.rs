//! Control API: health, readiness, metrics and `/api/v1` operator routes.
//!
//! Plain HTTP/1.1 over a loopback `TcpListener`, one thread per connection
//! so a client blocked on an approval never stalls the operator answering
//! it. Everything under `/api/v1` needs the bearer token written to
//! `token_path` at startup.

use crate::daemon::Daemon;
use crate::error::{gate_error, GateError};
use crate::shim::Submission;
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:18080".to_string(),
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

/// Bearer token for `/api/v1`, fixed for the life of the server.
#[derive(Clone, Debug)]
pub struct ApiToken {
    token: [u8; 32],
}

impl ApiToken {
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
        let diff = presented
            .iter()
            .zip(self.token.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(anyhow!("api token invalid"));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    daemon: Arc<Daemon>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, daemon: Arc<Daemon>) -> Self {
        Self { cfg, daemon }
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
        listener.set_nonblocking(true)?;

        let token = ApiToken::generate();
        let token_hex = token.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token_hex)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let daemon = self.daemon;
        let token_path = self.cfg.token_path.clone();
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, daemon, Arc::new(token), shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            token: token_hex,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    daemon: Arc<Daemon>,
    token: Arc<ApiToken>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let daemon = Arc::clone(&daemon);
                let token = Arc::clone(&token);
                let spawned = std::thread::Builder::new()
                    .name("control-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &daemon, &token) {
                            log::warn!("control api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("control api could not spawn a handler: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": code, "message": message });
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    fn text(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "text/plain; version=0.0.4",
            body: body.into_bytes(),
        }
    }
}

fn handle_connection(mut stream: TcpStream, daemon: &Daemon, token: &ApiToken) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        let response = Response::error(403, "forbidden", "loopback clients only");
        return write_response(&mut stream, &response);
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let response = Response::error(400, "bad_request", &format!("{:#}", err));
            write_response(&mut stream, &response)?;
            return Err(err);
        }
    };
    let response = route(&request, daemon, token);
    write_response(&mut stream, &response)
}

fn route(request: &HttpRequest, daemon: &Daemon, token: &ApiToken) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => return health(daemon),
        ("GET", "/ready") => return ready(daemon),
        ("GET", "/metrics") => {
            return match daemon.render_metrics() {
                Ok(text) => Response::text(200, text),
                Err(err) => error_response(&err),
            }
        }
        (_, "/health") | (_, "/ready") | (_, "/metrics") => {
            return Response::error(405, "method_not_allowed", "use GET")
        }
        _ => {}
    }

    let Some(rest) = request.path.strip_prefix("/api/v1/") else {
        return Response::error(404, "not_found", &request.path);
    };
    if request.has_query_token() {
        return Response::error(
            400,
            "token_query_param_not_allowed",
            "send the token in the Authorization header",
        );
    }
    let Some(presented) = request.bearer_token() else {
        return Response::error(401, "missing_token", "bearer token required");
    };
    if token.validate(&presented).is_err() {
        return Response::error(401, "invalid_token", "bearer token rejected");
    }

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match dispatch(request, &segments, daemon) {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &anyhow::Error) -> Response {
    let message = format!("{:#}", err);
    match gate_error(err) {
        Some(gate) => {
            let status = match gate {
                GateError::SessionNotFound(_) => 404,
                GateError::SessionState { .. } | GateError::ApprovalNotPending(_) => 409,
                GateError::PolicyValidation { .. } => 422,
                GateError::CapabilityUnavailable { .. } => 503,
                GateError::Evaluation(_)
                | GateError::AuditWrite(_)
                | GateError::ApprovalTimeout { .. } => 500,
            };
            Response::error(status, gate.code(), &message)
        }
        None => Response::error(400, "BAD_REQUEST", &message),
    }
}

#[derive(Deserialize)]
struct CreateSession {
    workspace: PathBuf,
    policy: Option<String>,
}

#[derive(Deserialize)]
struct ApprovalAnswer {
    approve: bool,
}

fn dispatch(request: &HttpRequest, segments: &[&str], daemon: &Daemon) -> Result<Response> {
    let method = request.method.as_str();
    match (method, segments) {
        ("GET", ["info"]) => Response::json(200, &daemon.info()),

        ("GET", ["capabilities"]) => Response::json(200, &*daemon.capabilities.current()),
        ("POST", ["capabilities", "refresh"]) => {
            Response::json(200, &*daemon.capabilities.refresh())
        }

        ("GET", ["policies"]) => Response::json(200, &daemon.policies.list()),
        ("POST", ["policies", "reload"]) => Response::json(200, &daemon.policies.reload()?),

        ("GET", ["sessions"]) => Response::json(200, &daemon.sessions.list()),
        ("POST", ["sessions"]) => {
            let body: CreateSession = request.json()?;
            let session = daemon
                .sessions
                .create(&body.workspace, body.policy.as_deref())?;
            Response::json(201, &session.info())
        }
        ("GET", ["sessions", id]) => Response::json(200, &daemon.sessions.get(id)?.info()),
        ("DELETE", ["sessions", id]) => Response::json(200, &daemon.sessions.terminate(id)?),
        ("POST", ["sessions", id, "suspend"]) => {
            Response::json(200, &daemon.sessions.suspend(id)?)
        }
        ("POST", ["sessions", id, "resume"]) => Response::json(200, &daemon.sessions.resume(id)?),
        ("POST", ["sessions", id, "intents"]) => {
            let submission: Submission = request.json()?;
            Response::json(200, &daemon.sessions.submit(id, submission)?)
        }
        ("GET", ["sessions", id, "events"]) => {
            daemon.sessions.get(id)?;
            let mut query = crate::audit::EventQuery::session(id);
            query.after_seq = request.query_u64("after")?;
            query.limit = request.query_u64("limit")?.map(|limit| limit as usize);
            Response::json(200, &daemon.audit.events(&query)?)
        }
        ("GET", ["sessions", id, "trash"]) => {
            daemon.sessions.get(id)?;
            Response::json(200, &daemon.quarantine.list(id)?)
        }
        ("POST", ["sessions", id, "trash", entry, "restore"]) => {
            daemon.sessions.get(id)?;
            Response::json(200, &daemon.quarantine.restore(id, entry)?)
        }

        ("GET", ["approvals"]) => Response::json(200, &daemon.approvals.pending()),
        ("POST", ["approvals", id]) => {
            let answer: ApprovalAnswer = request.json()?;
            Response::json(200, &daemon.approvals.resolve(id, answer.approve)?)
        }

        _ => Ok(Response::error(404, "not_found", &request.path)),
    }
}

fn health(daemon: &Daemon) -> Response {
    let audit = daemon.audit.health();
    let status = if audit.degraded { 503 } else { 200 };
    let body = serde_json::json!({
        "status": if audit.degraded { "degraded" } else { "ok" },
        "audit": audit,
    });
    Response {
        status,
        content_type: "application/json",
        body: body.to_string().into_bytes(),
    }
}

fn ready(daemon: &Daemon) -> Response {
    let ready = !daemon.policies.is_empty();
    let body = serde_json::json!({
        "ready": ready,
        "policies": daemon.policies.len(),
        "capabilities": &*daemon.capabilities.current(),
    });
    Response {
        status: if ready { 200 } else { 503 },
        content_type: "application/json",
        body: body.to_string().into_bytes(),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
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
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
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

    fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw_path
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or("")
            .split('&')
            .filter_map(|pair| pair.split_once('='))
    }

    fn has_query_token(&self) -> bool {
        self.query_pairs().any(|(k, _)| k == "token")
    }

    fn query_u64(&self, name: &str) -> Result<Option<u64>> {
        match self.query_pairs().find(|(k, _)| *k == name) {
            Some((_, value)) => value
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("query parameter {} must be an integer", name)),
            None => Ok(None),
        }
    }

    fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| anyhow!("invalid request body: {}", e))
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
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
