//! Append-only audit trail.
//!
//! Every shim decision becomes one [`AuditEvent`]. Events carry a global
//! sequence, a per-session sequence and a SHA-256 hash chain over the sealed
//! payload, so the trail can be replayed in order and checked for tampering.
//! Recording never fails the caller: store errors are counted and surfaced
//! as a degraded-audit health signal.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::intent::{IntentKind, IntentTarget};
use crate::policy::DecisionKind;

mod store;

pub use store::{AuditStore, InMemoryAuditStore, SqliteAuditStore};

/// What the shim actually did with an intent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Denied,
    /// Held for out-of-band confirmation; a second event records the answer.
    ApprovalPending,
    Approved,
    ApprovalDenied,
    ApprovalTimedOut,
    SoftDeleted,
    /// The shim's primitive is unavailable; the decision was advisory only.
    Unenforced,
    /// Evaluation failed and the intent was denied.
    EngineError,
    /// The session was not accepting intents.
    SessionInactive,
}

impl Outcome {
    pub const ALL: [Outcome; 10] = [
        Outcome::Allowed,
        Outcome::Denied,
        Outcome::ApprovalPending,
        Outcome::Approved,
        Outcome::ApprovalDenied,
        Outcome::ApprovalTimedOut,
        Outcome::SoftDeleted,
        Outcome::Unenforced,
        Outcome::EngineError,
        Outcome::SessionInactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Denied => "denied",
            Outcome::ApprovalPending => "approval_pending",
            Outcome::Approved => "approved",
            Outcome::ApprovalDenied => "approval_denied",
            Outcome::ApprovalTimedOut => "approval_timed_out",
            Outcome::SoftDeleted => "soft_deleted",
            Outcome::Unenforced => "unenforced",
            Outcome::EngineError => "engine_error",
            Outcome::SessionInactive => "session_inactive",
        }
    }
}

/// The unsealed content of an event, as handed in by a shim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub session_id: String,
    pub timestamp_ms: u64,
    pub kind: IntentKind,
    pub target: IntentTarget,
    pub decision: Option<DecisionKind>,
    pub rule: Option<String>,
    pub outcome: Outcome,
    pub reason: String,
    /// Archive location, exit status, or similar enforcement detail.
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn summary(&self) -> String {
        self.target.summary()
    }
}

/// A persisted, immutable audit event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub seq: u64,
    pub session_seq: u64,
    pub summary: String,
    #[serde(flatten)]
    pub record: AuditRecord,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// The hashed part of an event.
#[derive(Serialize)]
pub(crate) struct SealedBody<'a> {
    pub seq: u64,
    pub session_seq: u64,
    pub record: &'a AuditRecord,
}

pub(crate) fn sealed_payload(seq: u64, session_seq: u64, record: &AuditRecord) -> Result<String> {
    Ok(serde_json::to_string(&SealedBody {
        seq,
        session_seq,
        record,
    })?)
}

/// Hashes an event payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub after_seq: Option<u64>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub events: u64,
    pub head: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditHealth {
    pub degraded: bool,
    pub write_failures: u64,
    pub last_error: Option<String>,
}

struct LoggerState {
    store: Box<dyn AuditStore>,
    session_seqs: HashMap<String, u64>,
}

/// Serialises appends so both the global chain and each session's
/// sequence stay gap-free and ordered.
pub struct AuditLogger {
    state: Mutex<LoggerState>,
    write_failures: AtomicU64,
    degraded: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl AuditLogger {
    pub fn new(store: Box<dyn AuditStore>) -> Self {
        Self {
            state: Mutex::new(LoggerState {
                store,
                session_seqs: HashMap::new(),
            }),
            write_failures: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryAuditStore::default()))
    }

    pub fn open_sqlite(db_path: &str) -> Result<Self> {
        Ok(Self::new(Box::new(SqliteAuditStore::open(db_path)?)))
    }

    /// Appends one event. Returns `None` when the store rejected the write;
    /// the failure is logged and reflected in [`AuditLogger::health`].
    pub fn record(&self, record: AuditRecord) -> Option<AuditEvent> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let LoggerState {
            store,
            session_seqs,
        } = &mut *state;

        let next = match session_seqs.get(&record.session_id) {
            Some(seq) => Ok(seq + 1),
            None => store.session_head(&record.session_id).map(|seq| seq + 1),
        };
        let result = next.and_then(|session_seq| store.append(&record, session_seq));
        match result {
            Ok(event) => {
                session_seqs.insert(event.record.session_id.clone(), event.session_seq);
                self.degraded.store(false, Ordering::SeqCst);
                Some(event)
            }
            Err(err) => {
                self.write_failures.fetch_add(1, Ordering::SeqCst);
                self.degraded.store(true, Ordering::SeqCst);
                let message = format!("{:#}", err);
                log::error!(
                    "audit write failed for session {} ({}): {}",
                    record.session_id,
                    record.outcome.as_str(),
                    message
                );
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(message);
                }
                None
            }
        }
    }

    /// Drops the cached sequence head of a finished session. A later append
    /// for the same id reloads the head from the store.
    pub fn forget_session(&self, session_id: &str) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.session_seqs.remove(session_id);
    }

    #[cfg(test)]
    fn cached_sessions(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.session_seqs.len(),
            Err(poisoned) => poisoned.into_inner().session_seqs.len(),
        }
    }

    pub fn events(&self, query: &EventQuery) -> Result<Vec<AuditEvent>> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.store.events(query)
    }

    pub fn verify_chain(&self) -> Result<ChainReport> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.store.verify_chain()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> AuditHealth {
        AuditHealth {
            degraded: self.is_degraded(),
            write_failures: self.write_failures(),
            last_error: self.last_error.lock().ok().and_then(|last| last.clone()),
        }
    }
}
