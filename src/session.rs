//! Agent sessions and their lifecycle.
//!
//! `created -> active -> {suspended <-> active} -> terminated`. A session
//! freezes its degraded flags and binds a policy snapshot at creation;
//! neither changes afterwards. Termination revokes every shim registration
//! before the bound policy is released, and the record stays queryable.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::audit::{AuditLogger, AuditRecord, Outcome};
use crate::capability::{CapabilityRegistry, DegradedFlags};
use crate::error::{gate_error, GateError};
use crate::intent::{InterceptedIntent, IntentKind};
use crate::policy::{BindContext, BoundPolicy, Decision, PolicyEngine, PolicyStore};
use crate::shim::{ApprovalBroker, Shim, ShimStatus, Submission, Verdict};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Suspended,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Terminated => "terminated",
        }
    }
}

struct Lifecycle {
    state: SessionState,
    suspend_reason: Option<String>,
    terminated_at_ms: Option<u64>,
}

pub struct Session {
    pub id: String,
    pub workspace: PathBuf,
    pub policy_name: String,
    pub policy_digest: String,
    pub created_at_ms: u64,
    pub degraded: DegradedFlags,
    max_intents: Option<u64>,
    lifecycle: Mutex<Lifecycle>,
    policy: RwLock<Option<Arc<BoundPolicy>>>,
    intents: AtomicU64,
    events: Mutex<Vec<u64>>,
}

/// Serializable view of a session for the control API.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub workspace: PathBuf,
    pub policy: String,
    pub policy_digest: String,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub terminated_at_ms: Option<u64>,
    pub suspend_reason: Option<String>,
    pub degraded: DegradedFlags,
    /// True when at least one shim runs advisory-only for this session.
    pub enforcement_degraded: bool,
    pub intents: u64,
    pub max_intents: Option<u64>,
    pub event_count: usize,
    pub last_event_seq: Option<u64>,
}

/// Why a session refused an intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refusal {
    pub state: SessionState,
    pub reason: String,
}

impl Session {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle().state
    }

    /// The bound policy, or an evaluation error once the session released it.
    pub fn policy(&self) -> Result<Arc<BoundPolicy>> {
        let guard = match self.policy.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or_else(|| {
            anyhow!(GateError::Evaluation(format!(
                "session {} has no bound policy",
                self.id
            )))
        })
    }

    pub fn evaluate(&self, intent: &InterceptedIntent) -> Result<Decision> {
        let policy = self.policy()?;
        PolicyEngine::evaluate(intent, &policy)
    }

    /// Admits one intent: the session must be active, and the intent counts
    /// toward the quota. Reaching the quota suspends the session after this
    /// intent.
    pub fn admit(&self) -> std::result::Result<(), Refusal> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SessionState::Active {
            return Err(Refusal {
                state: lifecycle.state,
                reason: format!("session {} is {}", self.id, lifecycle.state.as_str()),
            });
        }
        let count = self.intents.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = self.max_intents {
            if count >= max {
                lifecycle.state = SessionState::Suspended;
                lifecycle.suspend_reason = Some(format!("intent quota of {} reached", max));
                log::warn!("session {} suspended: intent quota {} reached", self.id, max);
            }
        }
        Ok(())
    }

    pub fn push_event(&self, seq: u64) {
        if let Ok(mut events) = self.events.lock() {
            events.push(seq);
        }
    }

    pub fn event_seqs(&self) -> Vec<u64> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn info(&self) -> SessionInfo {
        let lifecycle = self.lifecycle();
        let events = self.event_seqs();
        SessionInfo {
            id: self.id.clone(),
            workspace: self.workspace.clone(),
            policy: self.policy_name.clone(),
            policy_digest: self.policy_digest.clone(),
            state: lifecycle.state,
            created_at_ms: self.created_at_ms,
            terminated_at_ms: lifecycle.terminated_at_ms,
            suspend_reason: lifecycle.suspend_reason.clone(),
            degraded: self.degraded,
            enforcement_degraded: self.degraded.any(),
            intents: self.intents.load(Ordering::SeqCst),
            max_intents: self.max_intents,
            event_count: events.len(),
            last_event_seq: events.last().copied(),
        }
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if !from.contains(&lifecycle.state) {
            return Err(anyhow!(GateError::SessionState {
                session_id: self.id.clone(),
                message: format!(
                    "cannot move from {} to {}",
                    lifecycle.state.as_str(),
                    to.as_str()
                ),
            }));
        }
        lifecycle.state = to;
        match to {
            SessionState::Suspended => {
                if lifecycle.suspend_reason.is_none() {
                    lifecycle.suspend_reason = Some("suspended by operator".to_string());
                }
            }
            SessionState::Active => lifecycle.suspend_reason = None,
            SessionState::Terminated => lifecycle.terminated_at_ms = Some(crate::now_ms()),
            SessionState::Created => {}
        }
        Ok(())
    }
}

/// Owns every session and routes submitted intents to the matching shim.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    policies: Arc<PolicyStore>,
    capabilities: Arc<CapabilityRegistry>,
    shims: Vec<Arc<dyn Shim>>,
    approvals: Arc<ApprovalBroker>,
    audit: Arc<AuditLogger>,
    default_policy: String,
    max_intents: Option<u64>,
}

impl SessionManager {
    pub fn new(
        policies: Arc<PolicyStore>,
        capabilities: Arc<CapabilityRegistry>,
        shims: Vec<Arc<dyn Shim>>,
        approvals: Arc<ApprovalBroker>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policies,
            capabilities,
            shims,
            approvals,
            audit,
            default_policy: crate::policy::BUILTIN_POLICY_NAME.to_string(),
            max_intents: None,
        }
    }

    pub fn with_default_policy(mut self, name: &str) -> Self {
        self.default_policy = name.to_string();
        self
    }

    pub fn with_max_intents(mut self, max: Option<u64>) -> Self {
        self.max_intents = max;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn shim_statuses(&self) -> Vec<ShimStatus> {
        self.shims.iter().map(|shim| shim.status()).collect()
    }

    fn shim_for(&self, kind: IntentKind) -> Result<&Arc<dyn Shim>> {
        self.shims
            .iter()
            .find(|shim| shim.kind() == kind)
            .ok_or_else(|| anyhow!("no shim handles {} intents", kind.as_str()))
    }

    /// Creates a session, binds its policy and activates it.
    pub fn create(&self, workspace: &Path, policy: Option<&str>) -> Result<Arc<Session>> {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("workspace {} is not accessible", workspace.display()))?;
        if !workspace.is_dir() {
            return Err(anyhow!("workspace {} is not a directory", workspace.display()));
        }
        let policy_name = policy.unwrap_or(&self.default_policy);
        let policy = self.policies.require(policy_name)?;
        let bound = policy.bind(&BindContext::for_workspace(&workspace))?;
        let matrix = self.capabilities.current();

        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let session = Arc::new(Session {
            id: format!("session-{}", hex::encode(bytes)),
            workspace,
            policy_name: policy.name.clone(),
            policy_digest: policy.digest.clone(),
            created_at_ms: crate::now_ms(),
            degraded: matrix.degraded_flags(),
            max_intents: self.max_intents,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                suspend_reason: None,
                terminated_at_ms: None,
            }),
            policy: RwLock::new(Some(Arc::new(bound))),
            intents: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        });

        for shim in &self.shims {
            if let Err(err) = shim.register(&session) {
                for registered in &self.shims {
                    registered.revoke(&session.id);
                }
                return Err(err).context("shim registration failed");
            }
        }
        session.transition(&[SessionState::Created], SessionState::Active)?;
        if session.degraded.any() {
            log::warn!(
                "session {} is advisory-only for: {}",
                session.id,
                degraded_list(&session.degraded)
            );
        }
        log::info!(
            "session {} created in {} with policy {}",
            session.id,
            session.workspace.display(),
            session.policy_name
        );

        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(session.id.clone(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!(GateError::SessionNotFound(id.to_string())))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        out
    }

    pub fn count_in(&self, state: SessionState) -> usize {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.values().filter(|s| s.state() == state).count()
    }

    pub fn suspend(&self, id: &str) -> Result<SessionInfo> {
        let session = self.get(id)?;
        session.transition(&[SessionState::Active], SessionState::Suspended)?;
        log::info!("session {} suspended", id);
        Ok(session.info())
    }

    /// Reactivates a suspended session and clears its intent counter.
    pub fn resume(&self, id: &str) -> Result<SessionInfo> {
        let session = self.get(id)?;
        session.transition(&[SessionState::Suspended], SessionState::Active)?;
        session.intents.store(0, Ordering::SeqCst);
        log::info!("session {} resumed", id);
        Ok(session.info())
    }

    /// Final teardown. Shim registrations go first, then pending approvals
    /// are refused, then the bound policy is dropped.
    pub fn terminate(&self, id: &str) -> Result<SessionInfo> {
        let session = self.get(id)?;
        session.transition(
            &[
                SessionState::Created,
                SessionState::Active,
                SessionState::Suspended,
            ],
            SessionState::Terminated,
        )?;
        for shim in &self.shims {
            shim.revoke(&session.id);
        }
        let refused = self.approvals.refuse_session(&session.id);
        match session.policy.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.audit.forget_session(&session.id);
        log::info!(
            "session {} terminated ({} pending approvals refused)",
            id,
            refused
        );
        Ok(session.info())
    }

    /// Terminates every live session; used at daemon shutdown.
    pub fn terminate_all(&self) {
        let ids: Vec<String> = self
            .list()
            .into_iter()
            .filter(|info| info.state != SessionState::Terminated)
            .map(|info| info.id)
            .collect();
        for id in ids {
            if let Err(err) = self.terminate(&id) {
                log::warn!("failed to terminate {}: {:#}", id, err);
            }
        }
    }

    /// Routes one intent to its shim and blocks until the verdict.
    ///
    /// Termination revokes the shim registration, so a terminated session
    /// surfaces as an unknown session inside the shim; that case is audited
    /// here as a refusal.
    pub fn submit(&self, id: &str, submission: Submission) -> Result<Verdict> {
        let session = self.get(id)?;
        let shim = self.shim_for(submission.target.kind())?;
        let target = submission.target.clone();
        match shim.process(&session.id, submission) {
            Err(err)
                if session.state() == SessionState::Terminated
                    && matches!(gate_error(&err), Some(GateError::SessionNotFound(_))) =>
            {
                let intent = InterceptedIntent::new(&session.id, target);
                Ok(self.refuse_terminated(&session, intent))
            }
            other => other,
        }
    }

    fn refuse_terminated(&self, session: &Session, intent: InterceptedIntent) -> Verdict {
        let reason = format!("session {} is terminated", session.id);
        let record = AuditRecord {
            session_id: session.id.clone(),
            timestamp_ms: intent.timestamp_ms,
            kind: intent.kind(),
            target: intent.target.clone(),
            decision: None,
            rule: None,
            outcome: Outcome::SessionInactive,
            reason: reason.clone(),
            detail: None,
            error: None,
        };
        let seq = self.audit.record(record).map(|event| event.seq);
        if let Some(seq) = seq {
            session.push_event(seq);
        }
        self.audit.forget_session(&session.id);
        Verdict::rejected(&intent, Outcome::SessionInactive, None, reason, seq)
    }
}

fn degraded_list(flags: &DegradedFlags) -> String {
    let mut names = Vec::new();
    if flags.command {
        names.push("command");
    }
    if flags.file {
        names.push("file");
    }
    if flags.network {
        names.push("network");
    }
    names.join(", ")
}
