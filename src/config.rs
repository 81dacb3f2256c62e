use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::DEFAULT_PROBE_TIMEOUT;
use crate::policy::BUILTIN_POLICY_NAME;
use crate::shim::{TimeoutFallback, DEFAULT_APPROVAL_TIMEOUT, DEFAULT_EXEC_TIMEOUT};

const DEFAULT_DB_PATH: &str = "agentgate.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:18080";
const DEFAULT_QUARANTINE_DIR: &str = "/var/lib/agentgate/quarantine";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AgentgateConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    policies: Option<PoliciesConfigFile>,
    approvals: Option<ApprovalsConfigFile>,
    sessions: Option<SessionsConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PoliciesConfigFile {
    dir: Option<PathBuf>,
    default: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApprovalsConfigFile {
    timeout_secs: Option<u64>,
    on_timeout: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SessionsConfigFile {
    quarantine_dir: Option<PathBuf>,
    max_intents_per_session: Option<u64>,
    exec_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AgentgateConfig {
    pub db_path: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub policy_dir: Option<PathBuf>,
    pub default_policy: String,
    pub approval_timeout: Duration,
    pub on_approval_timeout: TimeoutFallback,
    pub quarantine_dir: PathBuf,
    pub max_intents_per_session: Option<u64>,
    pub exec_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for AgentgateConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            api_token_path: None,
            policy_dir: None,
            default_policy: BUILTIN_POLICY_NAME.to_string(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            on_approval_timeout: TimeoutFallback::Deny,
            quarantine_dir: PathBuf::from(DEFAULT_QUARANTINE_DIR),
            max_intents_per_session: None,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl AgentgateConfig {
    /// File named by `AGENTGATE_CONFIG` (optional), then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AGENTGATE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: AgentgateConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentgateConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let on_approval_timeout = match file
            .approvals
            .as_ref()
            .and_then(|approvals| approvals.on_timeout.as_deref())
        {
            Some(value) => TimeoutFallback::parse(value)
                .ok_or_else(|| anyhow!("approvals.on_timeout must be \"deny\" or \"allow\""))?,
            None => defaults.on_approval_timeout,
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            api_addr: file
                .api
                .as_ref()
                .and_then(|api| api.addr.clone())
                .unwrap_or(defaults.api_addr),
            api_token_path: file.api.and_then(|api| api.token_path),
            policy_dir: file.policies.as_ref().and_then(|p| p.dir.clone()),
            default_policy: file
                .policies
                .and_then(|p| p.default)
                .unwrap_or(defaults.default_policy),
            approval_timeout: file
                .approvals
                .and_then(|approvals| approvals.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.approval_timeout),
            on_approval_timeout,
            quarantine_dir: file
                .sessions
                .as_ref()
                .and_then(|sessions| sessions.quarantine_dir.clone())
                .unwrap_or(defaults.quarantine_dir),
            max_intents_per_session: file
                .sessions
                .as_ref()
                .and_then(|sessions| sessions.max_intents_per_session),
            exec_timeout: file
                .sessions
                .and_then(|sessions| sessions.exec_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.exec_timeout),
            probe_timeout: file
                .detector
                .and_then(|detector| detector.probe_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AGENTGATE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("AGENTGATE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("AGENTGATE_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api_token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(dir) = std::env::var("AGENTGATE_POLICY_DIR") {
            if !dir.trim().is_empty() {
                self.policy_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(name) = std::env::var("AGENTGATE_DEFAULT_POLICY") {
            if !name.trim().is_empty() {
                self.default_policy = name.trim().to_string();
            }
        }
        if let Ok(secs) = std::env::var("AGENTGATE_APPROVAL_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("AGENTGATE_APPROVAL_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.approval_timeout = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("AGENTGATE_EXEC_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("AGENTGATE_EXEC_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.exec_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("AGENTGATE_QUARANTINE_DIR") {
            if !dir.trim().is_empty() {
                self.quarantine_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let addr: SocketAddr = self
            .api_addr
            .parse()
            .map_err(|_| anyhow!("api addr must be host:port, got {}", self.api_addr))?;
        if !addr.ip().is_loopback() {
            log::warn!(
                "control api bound to non-loopback address {}; remote peers still need the token",
                addr
            );
        }
        if self.approval_timeout.is_zero() {
            return Err(anyhow!("approval timeout must be greater than zero"));
        }
        if self.exec_timeout.is_zero() {
            return Err(anyhow!("exec timeout must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(anyhow!("probe timeout must be greater than zero"));
        }
        if self.max_intents_per_session == Some(0) {
            return Err(anyhow!("max_intents_per_session must be greater than zero"));
        }
        if self.default_policy.is_empty() {
            return Err(anyhow!("default policy name must not be empty"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AgentgateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
