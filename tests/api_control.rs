use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use agentgate::api::{ApiConfig, ApiHandle, ApiServer};
use agentgate::shim::TimeoutFallback;
use agentgate::{
    AgentgateConfig, AuditLogger, CapabilityMatrix, CapabilityRegistry, Daemon, PolicyStore,
};

struct TestApi {
    dir: TempDir,
    workspace: TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let workspace = tempdir()?;
        let cfg = AgentgateConfig {
            approval_timeout: Duration::from_secs(5),
            on_approval_timeout: TimeoutFallback::Deny,
            quarantine_dir: dir.path().join("quarantine"),
            ..AgentgateConfig::default()
        };
        let daemon = Daemon::assemble(
            &cfg,
            CapabilityRegistry::fixed(CapabilityMatrix::all_supported()),
            AuditLogger::in_memory(),
            PolicyStore::builtin_only()?,
        )?;
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            token_path: Some(dir.path().join("api.token")),
        };
        let api_handle = ApiServer::new(api_config, Arc::new(daemon)).spawn()?;
        Ok(Self {
            dir,
            workspace,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<(String, Value)> {
        let token = self.handle().token.clone();
        send(self.handle(), method, path, Some(&token), body)
    }

    fn create_session(&self) -> Result<String> {
        let body = serde_json::json!({ "workspace": self.workspace.path() });
        let (headers, value) = self.request("POST", "/api/v1/sessions", Some(&body))?;
        assert!(headers.contains("201 Created"), "{}", headers);
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn send(
    handle: &ApiHandle,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&Value>,
) -> Result<(String, Value)> {
    let mut stream = TcpStream::connect(handle.addr)?;
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {token}\r\n"));
    }
    if body.is_some() {
        request.push_str("Content-Type: application/json\r\n");
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload));
    stream.write_all(request.as_bytes())?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("");
    let value = serde_json::from_str(body).unwrap_or(Value::String(body.to_string()));
    Ok((headers, value))
}

#[test]
fn token_file_is_written_with_owner_only_permissions() -> Result<()> {
    let api = TestApi::new()?;
    let path = api.dir.path().join("api.token");
    let written = std::fs::read_to_string(&path)?;
    assert_eq!(written.trim(), api.handle().token);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    Ok(())
}

#[test]
fn api_rejects_missing_and_query_tokens() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = send(api.handle(), "GET", "/api/v1/info", None, None)?;
    assert!(headers.contains("401 Unauthorized"));

    let path = format!("/api/v1/info?token={}", api.handle().token);
    let (headers, body) = send(api.handle(), "GET", &path, None, None)?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "token_query_param_not_allowed");

    let (headers, _) = send(api.handle(), "GET", "/api/v1/info", Some("00"), None)?;
    assert!(headers.contains("401 Unauthorized"));
    Ok(())
}

#[test]
fn health_ready_and_metrics_are_public() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = send(api.handle(), "GET", "/health", None, None)?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Cache-Control: no-store"));
    assert_eq!(body["status"], "ok");

    let (headers, body) = send(api.handle(), "GET", "/ready", None, None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["ready"], true);

    let (headers, body) = send(api.handle(), "GET", "/metrics", None, None)?;
    assert!(headers.contains("200 OK"));
    assert!(body.as_str().unwrap_or("").contains("agentgate_uptime_seconds"));
    Ok(())
}

#[test]
fn session_lifecycle_over_http() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;
    assert!(id.starts_with("session-"));

    let (_, info) = api.request("GET", &format!("/api/v1/sessions/{id}"), None)?;
    assert_eq!(info["state"], "active");
    assert_eq!(info["policy"], "default");

    let (headers, info) = api.request("POST", &format!("/api/v1/sessions/{id}/suspend"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(info["state"], "suspended");
    let (headers, body) = api.request("POST", &format!("/api/v1/sessions/{id}/suspend"), None)?;
    assert!(headers.contains("409 Conflict"));
    assert_eq!(body["error"], "SESSION_STATE");

    api.request("POST", &format!("/api/v1/sessions/{id}/resume"), None)?;
    let (headers, info) = api.request("DELETE", &format!("/api/v1/sessions/{id}"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(info["state"], "terminated");

    let (headers, body) = api.request("GET", "/api/v1/sessions/session-missing", None)?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "SESSION_NOT_FOUND");
    Ok(())
}

#[test]
fn unknown_policy_is_unprocessable() -> Result<()> {
    let api = TestApi::new()?;
    let body = serde_json::json!({ "workspace": api.workspace.path(), "policy": "missing" });
    let (headers, body) = api.request("POST", "/api/v1/sessions", Some(&body))?;
    assert!(headers.contains("422 Unprocessable Entity"));
    assert_eq!(body["error"], "POLICY_VALIDATION");
    Ok(())
}

#[test]
fn submitted_intents_are_decided_and_audited() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;

    let intent = serde_json::json!({
        "target": { "kind": "exec", "program": "sudo", "args": ["apt-get", "install", "x"] }
    });
    let (headers, verdict) =
        api.request("POST", &format!("/api/v1/sessions/{id}/intents"), Some(&intent))?;
    assert!(headers.contains("200 OK"));
    assert_eq!(verdict["action"], "reject");
    assert_eq!(verdict["outcome"], "denied");
    assert_eq!(verdict["rule"], "block-container-escape");

    let intent = serde_json::json!({
        "target": { "kind": "net_connect", "host": "crates.io", "port": 443 }
    });
    let (_, verdict) =
        api.request("POST", &format!("/api/v1/sessions/{id}/intents"), Some(&intent))?;
    assert_eq!(verdict["outcome"], "allowed");

    let (_, events) = api.request("GET", &format!("/api/v1/sessions/{id}/events"), None)?;
    let events = events.as_array().cloned().unwrap_or_default();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["session_seq"], 1);
    assert_eq!(events[1]["session_seq"], 2);
    assert_eq!(events[1]["prev_hash"], events[0]["entry_hash"]);

    let after = events[0]["seq"].as_u64().unwrap_or_default();
    let (_, tail) = api.request(
        "GET",
        &format!("/api/v1/sessions/{id}/events?after={after}&limit=5"),
        None,
    )?;
    assert_eq!(tail.as_array().map(|a| a.len()), Some(1));
    Ok(())
}

#[test]
fn malformed_intent_body_is_a_bad_request() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;
    let intent = serde_json::json!({ "target": { "kind": "teleport" } });
    let (headers, _) =
        api.request("POST", &format!("/api/v1/sessions/{id}/intents"), Some(&intent))?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn approvals_are_listed_and_resolved_over_http() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;
    let addr_token = (api.handle().addr, api.handle().token.clone());

    let submitter = {
        let id = id.clone();
        std::thread::spawn(move || -> Result<Value> {
            let (addr, token) = addr_token;
            let mut stream = TcpStream::connect(addr)?;
            let payload = serde_json::json!({
                "target": { "kind": "exec", "program": "rm", "args": ["-rf", "build"] }
            })
            .to_string();
            let request = format!(
                "POST /api/v1/sessions/{id}/intents HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {token}\r\nContent-Length: {}\r\n\r\n{}",
                payload.len(),
                payload
            );
            stream.write_all(request.as_bytes())?;
            let mut response = String::new();
            stream.read_to_string(&mut response)?;
            let body = response.splitn(2, "\r\n\r\n").nth(1).unwrap_or("");
            Ok(serde_json::from_str(body)?)
        })
    };

    let mut approval_id = None;
    for _ in 0..200 {
        let (_, pending) = api.request("GET", "/api/v1/approvals", None)?;
        if let Some(first) = pending.as_array().and_then(|a| a.first()) {
            approval_id = first["id"].as_str().map(str::to_string);
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let approval_id = approval_id.expect("approval should be pending");

    let answer = serde_json::json!({ "approve": false });
    let (headers, _) = api.request(
        "POST",
        &format!("/api/v1/approvals/{approval_id}"),
        Some(&answer),
    )?;
    assert!(headers.contains("200 OK"));

    let verdict = submitter.join().unwrap()?;
    assert_eq!(verdict["outcome"], "approval_denied");
    assert_eq!(verdict["action"], "reject");

    let (headers, body) = api.request(
        "POST",
        &format!("/api/v1/approvals/{approval_id}"),
        Some(&answer),
    )?;
    assert!(headers.contains("409 Conflict"));
    assert_eq!(body["error"], "APPROVAL_NOT_PENDING");
    Ok(())
}

#[test]
fn trash_can_be_listed_and_restored() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;
    let data = api.workspace.path().join("data.txt");
    std::fs::write(&data, b"payload")?;

    let intent = serde_json::json!({
        "target": { "kind": "file_op", "path": "data.txt", "operation": "delete" }
    });
    let (_, verdict) =
        api.request("POST", &format!("/api/v1/sessions/{id}/intents"), Some(&intent))?;
    assert_eq!(verdict["action"], "soft_deleted");
    assert!(!data.exists());

    let (_, trash) = api.request("GET", &format!("/api/v1/sessions/{id}/trash"), None)?;
    let entry = trash[0]["id"].as_str().unwrap_or_default().to_string();
    let (headers, restored) = api.request(
        "POST",
        &format!("/api/v1/sessions/{id}/trash/{entry}/restore"),
        None,
    )?;
    assert!(headers.contains("200 OK"));
    assert_eq!(restored["restored"], true);
    assert_eq!(std::fs::read(&data)?, b"payload");
    Ok(())
}

#[test]
fn info_and_capabilities_report_shim_state() -> Result<()> {
    let api = TestApi::new()?;
    let (_, info) = api.request("GET", "/api/v1/info", None)?;
    assert_eq!(info["name"], "agentgate");
    assert_eq!(info["policies"], 1);
    assert_eq!(info["shims"].as_array().map(|s| s.len()), Some(3));

    let (_, caps) = api.request("GET", "/api/v1/capabilities", None)?;
    assert_eq!(caps["entries"]["command_notify"]["state"], "supported");

    let (_, policies) = api.request("GET", "/api/v1/policies", None)?;
    assert_eq!(policies[0]["name"], "default");
    Ok(())
}
