use anyhow::Result;
use rusqlite::{params, Connection};
use tempfile::tempdir;

use agentgate::audit::EventQuery;
use agentgate::shim::Submission;
use agentgate::{
    AgentgateConfig, AuditLogger, CapabilityMatrix, CapabilityRegistry, Daemon, IntentTarget,
    Outcome, PolicyStore,
};

fn daemon_with_db(db_path: &str, quarantine: &std::path::Path) -> Result<Daemon> {
    let cfg = AgentgateConfig {
        db_path: db_path.to_string(),
        quarantine_dir: quarantine.to_path_buf(),
        ..AgentgateConfig::default()
    };
    Daemon::assemble(
        &cfg,
        CapabilityRegistry::fixed(CapabilityMatrix::all_supported()),
        AuditLogger::open_sqlite(db_path)?,
        PolicyStore::builtin_only()?,
    )
}

#[test]
fn events_survive_restart_and_verify() -> Result<()> {
    let dir = tempdir()?;
    let workspace = tempdir()?;
    let db_path = dir.path().join("audit.db").to_string_lossy().to_string();

    let session_id = {
        let daemon = daemon_with_db(&db_path, &dir.path().join("q"))?;
        let session = daemon.sessions.create(workspace.path(), None)?;
        daemon.sessions.submit(
            &session.id,
            Submission::new(IntentTarget::exec("sudo", &["id"])),
        )?;
        daemon.sessions.submit(
            &session.id,
            Submission::new(IntentTarget::connect("pypi.org", 443)),
        )?;
        session.id.clone()
    };

    let logger = AuditLogger::open_sqlite(&db_path)?;
    let report = logger.verify_chain()?;
    assert_eq!(report.events, 2);

    let events = logger.events(&EventQuery::session(&session_id))?;
    let outcomes: Vec<Outcome> = events.iter().map(|e| e.record.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Denied, Outcome::Allowed]);
    assert_eq!(events[0].summary, "sudo id");
    assert_eq!(events[1].prev_hash, events[0].entry_hash);
    Ok(())
}

#[test]
fn per_session_sequence_resumes_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("audit.db").to_string_lossy().to_string();
    let workspace = tempdir()?;

    let session_id = {
        let daemon = daemon_with_db(&db_path, &dir.path().join("q"))?;
        let session = daemon.sessions.create(workspace.path(), None)?;
        daemon.sessions.submit(
            &session.id,
            Submission::new(IntentTarget::exec("ls", &[])),
        )?;
        session.id.clone()
    };

    // A fresh logger over the same file must continue the session's numbering.
    let logger = AuditLogger::open_sqlite(&db_path)?;
    let first = logger.events(&EventQuery::session(&session_id))?.remove(0);
    let mut record = first.record.clone();
    record.outcome = Outcome::SessionInactive;
    let event = logger.record(record).expect("append");
    assert_eq!(event.session_seq, 2);
    assert_eq!(event.seq, 2);
    assert_eq!(event.prev_hash, first.entry_hash);
    Ok(())
}

#[test]
fn tampered_rows_fail_verification() -> Result<()> {
    let dir = tempdir()?;
    let workspace = tempdir()?;
    let db_path = dir.path().join("audit.db").to_string_lossy().to_string();

    {
        let daemon = daemon_with_db(&db_path, &dir.path().join("q"))?;
        let session = daemon.sessions.create(workspace.path(), None)?;
        for _ in 0..3 {
            daemon.sessions.submit(
                &session.id,
                Submission::new(IntentTarget::exec("sudo", &["id"])),
            )?;
        }
    }

    let conn = Connection::open(&db_path)?;
    let payload: String = conn.query_row(
        "SELECT payload_json FROM audit_events WHERE seq = 2",
        [],
        |row| row.get(0),
    )?;
    let forged = payload.replace("\"denied\"", "\"allowed\"");
    assert_ne!(forged, payload);
    conn.execute(
        "UPDATE audit_events SET payload_json = ?1 WHERE seq = 2",
        params![forged],
    )?;
    drop(conn);

    let logger = AuditLogger::open_sqlite(&db_path)?;
    let err = logger.verify_chain().unwrap_err();
    assert!(err.to_string().contains("seq 2"));
    Ok(())
}

#[test]
fn shared_memory_database_is_usable() -> Result<()> {
    let uri = agentgate::shared_memory_uri();
    let logger = AuditLogger::open_sqlite(&uri)?;
    assert_eq!(logger.verify_chain()?.events, 0);
    assert!(!logger.is_degraded());
    Ok(())
}
