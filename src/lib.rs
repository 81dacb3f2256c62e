//! agentgate
//!
//! Mediates what an AI agent session may do on its host. Shims capture
//! command executions, filesystem operations and outbound connections,
//! the policy engine decides, and every outcome lands in a hash-chained
//! audit log.
//!
//! # Module Structure
//!
//! - `capability`: probes for the kernel primitives each shim needs
//! - `policy`: policy documents, validation and first-match evaluation
//! - `shim`: command, filesystem and network interception plus approvals
//!   and the soft-delete quarantine
//! - `session`: session lifecycle and policy binding
//! - `audit`: append-only event log (SQLite or in-memory)
//! - `api`: loopback control API
//! - `daemon`: wiring for `agentgated`

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod audit;
pub mod capability;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod intent;
pub mod metrics;
pub mod policy;
pub mod session;
pub mod shim;

pub use audit::{AuditEvent, AuditLogger, AuditRecord, EventQuery, Outcome};
pub use capability::{
    Capability, CapabilityDetector, CapabilityMatrix, CapabilityRegistry, CapabilityState,
};
pub use config::AgentgateConfig;
pub use daemon::Daemon;
pub use error::{gate_error, GateError};
pub use intent::{FileOperation, IntentKind, IntentTarget, InterceptedIntent};
pub use policy::{Decision, DecisionKind, PolicyEngine, PolicySet, PolicyStore};
pub use session::{Session, SessionManager, SessionState};
pub use shim::{Action, Shim, Submission, Verdict};

/// Milliseconds since the Unix epoch; 0 if the clock reads before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A private shared-cache in-memory SQLite URI, for tests and ephemeral runs.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:agentgate_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
