//! Interception shims.
//!
//! Each shim owns one class of intent and one interception primitive. All
//! three run the same protocol ([`Shim::process`]): admit the intent against
//! the session, ask the policy engine, hold for approval when required,
//! enforce, and audit every outcome. A shim whose primitive is missing for a
//! session still evaluates, but records the result as `unenforced`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::audit::{AuditLogger, AuditRecord, Outcome};
use crate::capability::{Capability, CapabilityRegistry, CapabilityState};
use crate::error::GateError;
use crate::intent::{InterceptedIntent, IntentKind, IntentTarget};
use crate::metrics::Metrics;
use crate::policy::{Decision, DecisionKind};
use crate::session::Session;

pub mod approval;
pub mod command;
pub mod filesystem;
pub mod network;
pub mod quarantine;

pub use approval::{
    ApprovalBroker, ApprovalResolution, PendingApproval, TimeoutFallback,
    DEFAULT_APPROVAL_TIMEOUT,
};
pub use command::{CommandShim, ExecOutput, DEFAULT_EXEC_TIMEOUT};
pub use filesystem::FilesystemShim;
pub use network::NetworkShim;
pub use quarantine::{Quarantine, TrashEntry};

/// Shared collaborators handed to every shim.
#[derive(Clone)]
pub struct ShimContext {
    pub audit: Arc<AuditLogger>,
    pub approvals: Arc<ApprovalBroker>,
    pub metrics: Arc<Metrics>,
}

/// What the agent is told to do with its suspended operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Proceed,
    Reject,
    /// The delete was replaced by an archival move; do not delete.
    SoftDeleted,
    /// Not mediated; the operation proceeds on its own.
    Unenforced,
}

/// An intent as submitted by a client, with submission options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub target: IntentTarget,
    /// Have the daemon perform an allowed exec inside the workspace.
    #[serde(default)]
    pub run: bool,
}

impl Submission {
    pub fn new(target: IntentTarget) -> Self {
        Self { target, run: false }
    }

    pub fn run(target: IntentTarget) -> Self {
        Self { target, run: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub session_id: String,
    pub kind: IntentKind,
    pub summary: String,
    pub action: Action,
    pub outcome: Outcome,
    pub decision: Option<DecisionKind>,
    pub rule: Option<String>,
    pub reason: String,
    pub detail: Option<String>,
    pub output: Option<ExecOutput>,
    pub audit_seq: Option<u64>,
}

impl Verdict {
    pub fn rejected(
        intent: &InterceptedIntent,
        outcome: Outcome,
        decision: Option<&Decision>,
        reason: String,
        audit_seq: Option<u64>,
    ) -> Self {
        Self {
            session_id: intent.session_id.clone(),
            kind: intent.kind(),
            summary: intent.target.summary(),
            action: Action::Reject,
            outcome,
            decision: decision.map(|d| d.kind),
            rule: decision.and_then(|d| d.rule.clone()),
            reason,
            detail: None,
            output: None,
            audit_seq,
        }
    }
}

/// Result of applying a final decision.
#[derive(Clone, Debug, Default)]
pub struct Applied {
    pub detail: Option<String>,
    pub output: Option<ExecOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShimStatus {
    pub kind: IntentKind,
    pub capability: Capability,
    pub state: CapabilityState,
    /// Enforcement for new sessions; existing sessions keep their frozen flags.
    pub enforcing: bool,
    pub sessions: usize,
}

/// Sessions a shim currently intercepts for.
#[derive(Default)]
pub struct Registrations {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registrations {
    pub fn insert(&self, session: &Arc<Session>) {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(session.id.clone(), Arc::clone(session));
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.remove(session_id).is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        match self.sessions.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Shim: Send + Sync {
    fn kind(&self) -> IntentKind;

    /// The interception primitive this shim depends on.
    fn capability(&self) -> Capability;

    fn context(&self) -> &ShimContext;

    fn registrations(&self) -> &Registrations;

    fn capabilities(&self) -> &CapabilityRegistry;

    fn status(&self) -> ShimStatus {
        let state = self.capabilities().current().state(self.capability());
        ShimStatus {
            kind: self.kind(),
            capability: self.capability(),
            state,
            enforcing: state == CapabilityState::Supported,
            sessions: self.registrations().len(),
        }
    }

    fn register(&self, session: &Arc<Session>) -> Result<()> {
        self.registrations().insert(session);
        if session.degraded.for_capability(self.capability()) {
            log::warn!(
                "{} shim is advisory-only for session {}: {} unavailable",
                self.kind().as_str(),
                session.id,
                self.capability()
            );
        }
        Ok(())
    }

    fn revoke(&self, session_id: &str) {
        if self.registrations().remove(session_id) {
            log::debug!("{} shim released session {}", self.kind().as_str(), session_id);
        }
    }

    /// Captures the attempted operation as an intent.
    fn intercept(&self, session: &Session, target: IntentTarget) -> Result<InterceptedIntent> {
        if target.kind() != self.kind() {
            return Err(anyhow!(
                "{} shim cannot intercept {} intents",
                self.kind().as_str(),
                target.kind().as_str()
            ));
        }
        Ok(InterceptedIntent::new(&session.id, target))
    }

    fn query_policy(&self, session: &Session, intent: &InterceptedIntent) -> Result<Decision> {
        session.evaluate(intent)
    }

    /// Applies a final decision. `kind` is never `approve`: approvals are
    /// resolved to allow or deny before enforcement.
    fn enforce(
        &self,
        _session: &Session,
        _intent: &InterceptedIntent,
        kind: DecisionKind,
        _run: bool,
    ) -> Result<Applied> {
        match kind {
            DecisionKind::Allow | DecisionKind::Deny => Ok(Applied::default()),
            other => Err(anyhow!(GateError::Evaluation(format!(
                "{} shim cannot apply {}",
                self.kind().as_str(),
                other.as_str()
            )))),
        }
    }

    /// Runs the full interception protocol for one intent and blocks until
    /// it is decided.
    fn process(&self, session_id: &str, submission: Submission) -> Result<Verdict> {
        run_protocol(self, session_id, submission)
    }
}

/// Builds the command, filesystem and network shims over shared state.
pub fn standard_shims(
    ctx: &ShimContext,
    capabilities: &Arc<CapabilityRegistry>,
    quarantine: Arc<Quarantine>,
    exec_timeout: Duration,
) -> Vec<Arc<dyn Shim>> {
    vec![
        Arc::new(CommandShim::new(
            ctx.clone(),
            Arc::clone(capabilities),
            exec_timeout,
        )),
        Arc::new(FilesystemShim::new(
            ctx.clone(),
            Arc::clone(capabilities),
            quarantine,
        )),
        Arc::new(NetworkShim::new(ctx.clone(), Arc::clone(capabilities))),
    ]
}

/// Records audit events for one intent and builds its verdict.
struct Trail<'a> {
    ctx: &'a ShimContext,
    session: &'a Session,
    intent: &'a InterceptedIntent,
}

impl<'a> Trail<'a> {
    fn record(
        &self,
        decision: Option<&Decision>,
        outcome: Outcome,
        reason: &str,
        detail: Option<String>,
        error: Option<String>,
    ) -> Option<u64> {
        let record = AuditRecord {
            session_id: self.session.id.clone(),
            timestamp_ms: self.intent.timestamp_ms,
            kind: self.intent.kind(),
            target: self.intent.target.clone(),
            decision: decision.map(|d| d.kind),
            rule: decision.and_then(|d| d.rule.clone()),
            outcome,
            reason: reason.to_string(),
            detail,
            error,
        };
        let event = self.ctx.audit.record(record)?;
        self.session.push_event(event.seq);
        Some(event.seq)
    }

    fn finish(
        &self,
        decision: Option<&Decision>,
        outcome: Outcome,
        action: Action,
        reason: String,
        applied: Applied,
        error: Option<String>,
    ) -> Verdict {
        let audit_seq = self.record(decision, outcome, &reason, applied.detail.clone(), error);
        self.ctx.metrics.record_intent(self.intent.kind(), outcome);
        let summary = self.intent.target.summary();
        match action {
            Action::Reject => log::warn!(
                "session {}: {} {} ({})",
                self.session.id,
                outcome.as_str(),
                summary,
                reason
            ),
            _ => log::debug!(
                "session {}: {} {} ({})",
                self.session.id,
                outcome.as_str(),
                summary,
                reason
            ),
        }
        Verdict {
            session_id: self.session.id.clone(),
            kind: self.intent.kind(),
            summary,
            action,
            outcome,
            decision: decision.map(|d| d.kind),
            rule: decision.and_then(|d| d.rule.clone()),
            reason,
            detail: applied.detail,
            output: applied.output,
            audit_seq,
        }
    }
}

fn run_protocol<S: Shim + ?Sized>(
    shim: &S,
    session_id: &str,
    submission: Submission,
) -> Result<Verdict> {
    let session = shim
        .registrations()
        .get(session_id)
        .ok_or_else(|| anyhow!(GateError::SessionNotFound(session_id.to_string())))?;
    let intent = shim.intercept(&session, submission.target)?;
    let ctx = shim.context();
    let trail = Trail {
        ctx,
        session: &session,
        intent: &intent,
    };

    if let Err(refusal) = session.admit() {
        return Ok(trail.finish(
            None,
            Outcome::SessionInactive,
            Action::Reject,
            refusal.reason,
            Applied::default(),
            None,
        ));
    }

    let advisory = session.degraded.for_capability(shim.capability());
    let decision = match shim.query_policy(&session, &intent) {
        Ok(decision) => decision,
        Err(err) if advisory => {
            return Ok(trail.finish(
                None,
                Outcome::Unenforced,
                Action::Unenforced,
                format!("{} unavailable; policy evaluation failed", shim.capability()),
                Applied::default(),
                Some(format!("{:#}", err)),
            ));
        }
        Err(err) => {
            log::error!(
                "policy evaluation failed in session {}: {:#}",
                session.id,
                err
            );
            return Ok(trail.finish(
                None,
                Outcome::EngineError,
                Action::Reject,
                "policy evaluation failed; denied".to_string(),
                Applied::default(),
                Some(format!("{:#}", err)),
            ));
        }
    };

    if advisory {
        let unavailable = GateError::CapabilityUnavailable {
            capability: shim.capability(),
            detail: format!("session {} runs without enforcement", session.id),
        };
        return Ok(trail.finish(
            Some(&decision),
            Outcome::Unenforced,
            Action::Unenforced,
            format!(
                "{} unavailable; policy would {}: {}",
                shim.capability(),
                decision.kind.as_str(),
                decision.reason
            ),
            Applied::default(),
            Some(unavailable.to_string()),
        ));
    }

    let mut reason = decision.reason.clone();
    let mut error = None;
    let (final_kind, outcome) = match decision.kind {
        DecisionKind::Allow => (DecisionKind::Allow, Outcome::Allowed),
        DecisionKind::Deny => (DecisionKind::Deny, Outcome::Denied),
        DecisionKind::SoftDelete => (DecisionKind::SoftDelete, Outcome::SoftDeleted),
        DecisionKind::Approve => {
            let pending = ctx.approvals.open(
                &session.id,
                &intent.target.summary(),
                decision.rule.as_deref(),
            );
            trail.record(
                Some(&decision),
                Outcome::ApprovalPending,
                &decision.reason,
                Some(pending.id.clone()),
                None,
            );
            match ctx.approvals.wait(&pending.id) {
                ApprovalResolution::Approved => {
                    reason = format!("approved by operator ({})", pending.id);
                    (DecisionKind::Allow, Outcome::Approved)
                }
                ApprovalResolution::Denied => {
                    reason = format!("approval {} refused", pending.id);
                    (DecisionKind::Deny, Outcome::ApprovalDenied)
                }
                ApprovalResolution::TimedOut => {
                    let fallback = ctx.approvals.on_timeout();
                    reason = format!(
                        "approval {} not answered within {}s; fallback {}",
                        pending.id,
                        ctx.approvals.timeout().as_secs(),
                        fallback.as_str()
                    );
                    error = Some(
                        GateError::ApprovalTimeout {
                            approval_id: pending.id.clone(),
                        }
                        .to_string(),
                    );
                    match fallback {
                        TimeoutFallback::Deny => (DecisionKind::Deny, Outcome::ApprovalTimedOut),
                        TimeoutFallback::Allow => (DecisionKind::Allow, Outcome::ApprovalTimedOut),
                    }
                }
            }
        }
    };

    let verdict = match shim.enforce(&session, &intent, final_kind, submission.run) {
        Ok(applied) => {
            let action = match final_kind {
                DecisionKind::Deny => Action::Reject,
                DecisionKind::SoftDelete => Action::SoftDeleted,
                _ => Action::Proceed,
            };
            trail.finish(Some(&decision), outcome, action, reason, applied, error)
        }
        Err(err) => trail.finish(
            Some(&decision),
            Outcome::Denied,
            Action::Reject,
            format!("enforcement failed: {:#}", err),
            Applied::default(),
            Some(format!("{:#}", err)),
        ),
    };
    Ok(verdict)
}
