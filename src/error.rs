//! Error taxonomy for the interception pipeline.
//!
//! Internal APIs return `anyhow::Result`; the variants here travel inside
//! `anyhow::Error` and are recovered with `downcast_ref` where the caller
//! needs to tell them apart (the control API maps them to status codes).

use crate::capability::Capability;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateError {
    /// Probe found the primitive missing or nonfunctional.
    CapabilityUnavailable {
        capability: Capability,
        detail: String,
    },
    /// A policy document failed validation; the whole document is rejected.
    PolicyValidation {
        policy: String,
        rule: Option<String>,
        message: String,
    },
    /// Internal fault while evaluating an intent. Enforcement treats it as deny.
    Evaluation(String),
    /// No confirmation arrived within the approval window.
    ApprovalTimeout { approval_id: String },
    /// The audit store rejected a write.
    AuditWrite(String),
    SessionNotFound(String),
    SessionState { session_id: String, message: String },
    ApprovalNotPending(String),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::CapabilityUnavailable { .. } => "CAPABILITY_UNAVAILABLE",
            GateError::PolicyValidation { .. } => "POLICY_VALIDATION",
            GateError::Evaluation(_) => "EVALUATION_ERROR",
            GateError::ApprovalTimeout { .. } => "APPROVAL_TIMEOUT",
            GateError::AuditWrite(_) => "AUDIT_WRITE",
            GateError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            GateError::SessionState { .. } => "SESSION_STATE",
            GateError::ApprovalNotPending(_) => "APPROVAL_NOT_PENDING",
        }
    }

    pub fn validation(policy: &str, rule: Option<&str>, message: impl Into<String>) -> Self {
        GateError::PolicyValidation {
            policy: policy.to_string(),
            rule: rule.map(str::to_string),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::CapabilityUnavailable { capability, detail } => {
                write!(f, "{}: {} unavailable: {}", self.code(), capability, detail)
            }
            GateError::PolicyValidation {
                policy,
                rule: Some(rule),
                message,
            } => write!(
                f,
                "{}: policy {} rule {}: {}",
                self.code(),
                policy,
                rule,
                message
            ),
            GateError::PolicyValidation {
                policy,
                rule: None,
                message,
            } => write!(f, "{}: policy {}: {}", self.code(), policy, message),
            GateError::Evaluation(message) => write!(f, "{}: {}", self.code(), message),
            GateError::ApprovalTimeout { approval_id } => {
                write!(f, "{}: approval {} was not answered", self.code(), approval_id)
            }
            GateError::AuditWrite(message) => write!(f, "{}: {}", self.code(), message),
            GateError::SessionNotFound(id) => write!(f, "{}: no session {}", self.code(), id),
            GateError::SessionState {
                session_id,
                message,
            } => write!(f, "{}: session {}: {}", self.code(), session_id, message),
            GateError::ApprovalNotPending(id) => {
                write!(f, "{}: approval {} is not pending", self.code(), id)
            }
        }
    }
}

impl std::error::Error for GateError {}

/// Finds a `GateError` anywhere in an `anyhow` chain.
pub fn gate_error(err: &anyhow::Error) -> Option<&GateError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GateError>())
}
