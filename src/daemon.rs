use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::capability::{CapabilityDetector, CapabilityRegistry};
use crate::config::AgentgateConfig;
use crate::metrics::{Gauges, Metrics};
use crate::policy::PolicyStore;
use crate::session::{SessionManager, SessionState};
use crate::shim::{self, ApprovalBroker, Quarantine, ShimContext, ShimStatus};

/// Everything the control API and the shims share, wired once at startup.
pub struct Daemon {
    pub capabilities: Arc<CapabilityRegistry>,
    pub policies: Arc<PolicyStore>,
    pub audit: Arc<AuditLogger>,
    pub approvals: Arc<ApprovalBroker>,
    pub quarantine: Arc<Quarantine>,
    pub metrics: Arc<Metrics>,
    pub sessions: SessionManager,
}

#[derive(Clone, Debug, Serialize)]
pub struct DaemonInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub policies: usize,
    pub sessions: usize,
    pub shims: Vec<ShimStatus>,
    pub audit_degraded: bool,
}

impl Daemon {
    /// Probes the host, opens the audit store and loads policies.
    pub fn open(cfg: &AgentgateConfig) -> Result<Self> {
        let capabilities = CapabilityRegistry::detect_with(CapabilityDetector::new(cfg.probe_timeout));
        let audit = AuditLogger::open_sqlite(&cfg.db_path)
            .with_context(|| format!("failed to open audit store {}", cfg.db_path))?;
        let (policies, report) = PolicyStore::open(cfg.policy_dir.as_deref())?;
        if !report.rejected.is_empty() {
            log::warn!("{} policy file(s) rejected at startup", report.rejected.len());
        }
        policies.require(&cfg.default_policy)?;
        Self::assemble(cfg, capabilities, audit, policies)
    }

    /// Wires already-constructed parts; used by tests and embedders.
    pub fn assemble(
        cfg: &AgentgateConfig,
        capabilities: CapabilityRegistry,
        audit: AuditLogger,
        policies: PolicyStore,
    ) -> Result<Self> {
        let capabilities = Arc::new(capabilities);
        let policies = Arc::new(policies);
        let audit = Arc::new(audit);
        let approvals = Arc::new(ApprovalBroker::new(
            cfg.approval_timeout,
            cfg.on_approval_timeout,
        ));
        let quarantine = Arc::new(Quarantine::new(cfg.quarantine_dir.clone()));
        let metrics = Arc::new(Metrics::new()?);
        let ctx = ShimContext {
            audit: Arc::clone(&audit),
            approvals: Arc::clone(&approvals),
            metrics: Arc::clone(&metrics),
        };
        let shims = shim::standard_shims(
            &ctx,
            &capabilities,
            Arc::clone(&quarantine),
            cfg.exec_timeout,
        );
        let sessions = SessionManager::new(
            Arc::clone(&policies),
            Arc::clone(&capabilities),
            shims,
            Arc::clone(&approvals),
            Arc::clone(&audit),
        )
        .with_default_policy(&cfg.default_policy)
        .with_max_intents(cfg.max_intents_per_session);
        Ok(Self {
            capabilities,
            policies,
            audit,
            approvals,
            quarantine,
            metrics,
            sessions,
        })
    }

    pub fn info(&self) -> DaemonInfo {
        DaemonInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.metrics.uptime_secs(),
            policies: self.policies.len(),
            sessions: self.sessions.list().len(),
            shims: self.sessions.shim_statuses(),
            audit_degraded: self.audit.is_degraded(),
        }
    }

    pub fn render_metrics(&self) -> Result<String> {
        let matrix = self.capabilities.current();
        let health = self.audit.health();
        self.metrics.render(&Gauges {
            active_sessions: self.sessions.count_in(SessionState::Active),
            suspended_sessions: self.sessions.count_in(SessionState::Suspended),
            terminated_sessions: self.sessions.count_in(SessionState::Terminated),
            pending_approvals: self.approvals.pending().len(),
            audit_write_failures: health.write_failures,
            audit_degraded: health.degraded,
            capabilities: &matrix,
        })
    }

    pub fn shutdown(&self) {
        self.sessions.terminate_all();
    }
}
