use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::GateError;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// What an unanswered approval turns into.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutFallback {
    #[default]
    Deny,
    Allow,
}

impl TimeoutFallback {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deny" => Some(TimeoutFallback::Deny),
            "allow" => Some(TimeoutFallback::Allow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutFallback::Deny => "deny",
            TimeoutFallback::Allow => "allow",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Approved,
    Denied,
    TimedOut,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub rule: Option<String>,
    pub requested_at_ms: u64,
}

struct Slot {
    request: PendingApproval,
    answer: Option<bool>,
}

/// Rendezvous between a suspended intent and an operator's answer.
///
/// Each approval resolves exactly once: the waiting shim removes the slot
/// when it wakes, so a late answer finds nothing pending.
pub struct ApprovalBroker {
    slots: Mutex<HashMap<String, Slot>>,
    answered: Condvar,
    timeout: Duration,
    on_timeout: TimeoutFallback,
}

impl ApprovalBroker {
    pub fn new(timeout: Duration, on_timeout: TimeoutFallback) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            answered: Condvar::new(),
            timeout,
            on_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn on_timeout(&self) -> TimeoutFallback {
        self.on_timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn open(&self, session_id: &str, summary: &str, rule: Option<&str>) -> PendingApproval {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let request = PendingApproval {
            id: format!("approval-{}", hex::encode(bytes)),
            session_id: session_id.to_string(),
            summary: summary.to_string(),
            rule: rule.map(str::to_string),
            requested_at_ms: crate::now_ms(),
        };
        self.lock().insert(
            request.id.clone(),
            Slot {
                request: request.clone(),
                answer: None,
            },
        );
        log::info!(
            "approval {} pending for session {}: {}",
            request.id,
            session_id,
            summary
        );
        request
    }

    /// Blocks until the approval is answered or the timeout elapses.
    pub fn wait(&self, approval_id: &str) -> ApprovalResolution {
        let deadline = Instant::now() + self.timeout;
        let mut slots = self.lock();
        loop {
            let answer = match slots.get(approval_id) {
                Some(slot) => slot.answer,
                None => return ApprovalResolution::Denied,
            };
            if let Some(approved) = answer {
                slots.remove(approval_id);
                return if approved {
                    ApprovalResolution::Approved
                } else {
                    ApprovalResolution::Denied
                };
            }
            let now = Instant::now();
            if now >= deadline {
                slots.remove(approval_id);
                log::warn!("approval {} timed out", approval_id);
                return ApprovalResolution::TimedOut;
            }
            slots = match self.answered.wait_timeout(slots, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn resolve(&self, approval_id: &str, approve: bool) -> Result<PendingApproval> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(approval_id)
            .filter(|slot| slot.answer.is_none())
            .ok_or_else(|| anyhow!(GateError::ApprovalNotPending(approval_id.to_string())))?;
        slot.answer = Some(approve);
        let request = slot.request.clone();
        drop(slots);
        self.answered.notify_all();
        log::info!(
            "approval {} {}",
            approval_id,
            if approve { "granted" } else { "refused" }
        );
        Ok(request)
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        let slots = self.lock();
        let mut out: Vec<PendingApproval> = slots
            .values()
            .filter(|slot| slot.answer.is_none())
            .map(|slot| slot.request.clone())
            .collect();
        out.sort_by(|a, b| a.requested_at_ms.cmp(&b.requested_at_ms).then(a.id.cmp(&b.id)));
        out
    }

    /// Refuses every open approval of a session that is going away.
    pub fn refuse_session(&self, session_id: &str) -> usize {
        let mut slots = self.lock();
        let mut refused = 0;
        for slot in slots.values_mut() {
            if slot.request.session_id == session_id && slot.answer.is_none() {
                slot.answer = Some(false);
                refused += 1;
            }
        }
        drop(slots);
        if refused > 0 {
            self.answered.notify_all();
        }
        refused
    }
}
