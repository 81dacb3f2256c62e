use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    hash_entry, sealed_payload, AuditEvent, AuditRecord, ChainReport, EventQuery,
};
use crate::error::GateError;

/// Durable home of the audit chain. Implementations assign the global
/// sequence and chain hashes; the caller supplies the per-session sequence.
pub trait AuditStore: Send {
    fn append(&mut self, record: &AuditRecord, session_seq: u64) -> Result<AuditEvent>;

    /// Highest per-session sequence already stored, or 0.
    fn session_head(&self, session_id: &str) -> Result<u64>;

    fn events(&self, query: &EventQuery) -> Result<Vec<AuditEvent>>;

    fn verify_chain(&self) -> Result<ChainReport>;
}

fn seal(
    seq: u64,
    session_seq: u64,
    record: &AuditRecord,
    prev_hash: [u8; 32],
) -> Result<(AuditEvent, String)> {
    let payload = sealed_payload(seq, session_seq, record)?;
    let entry_hash = hash_entry(&prev_hash, payload.as_bytes());
    let event = AuditEvent {
        seq,
        session_seq,
        summary: record.summary(),
        record: record.clone(),
        prev_hash: hex::encode(prev_hash),
        entry_hash: hex::encode(entry_hash),
    };
    Ok((event, payload))
}

fn check_link(
    event: &AuditEvent,
    expected_prev: &[u8; 32],
) -> Result<[u8; 32]> {
    if event.prev_hash != hex::encode(expected_prev) {
        return Err(anyhow!(
            "audit chain broken at seq {}: prev_hash does not match predecessor",
            event.seq
        ));
    }
    let payload = sealed_payload(event.seq, event.session_seq, &event.record)?;
    let computed = hash_entry(expected_prev, payload.as_bytes());
    if hex::encode(computed) != event.entry_hash {
        return Err(anyhow!(
            "audit chain broken at seq {}: entry_hash mismatch",
            event.seq
        ));
    }
    Ok(computed)
}

fn matches_query(event: &AuditEvent, query: &EventQuery) -> bool {
    if let Some(session) = &query.session_id {
        if &event.record.session_id != session {
            return false;
        }
    }
    if let Some(after) = query.after_seq {
        if event.seq <= after {
            return false;
        }
    }
    true
}

pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS audit_events (
              seq INTEGER PRIMARY KEY,
              session_id TEXT NOT NULL,
              session_seq INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              kind TEXT NOT NULL,
              summary TEXT NOT NULL,
              decision TEXT,
              rule TEXT,
              outcome TEXT NOT NULL,
              error TEXT,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_session
              ON audit_events(session_id, session_seq);
            "#,
        )?;
        Ok(())
    }

    fn last_entry(&self) -> Result<(u64, [u8; 32])> {
        let row = self
            .conn
            .query_row(
                "SELECT seq, entry_hash FROM audit_events ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        match row {
            Some((seq, hash)) => Ok((seq as u64, blob32(hash, "audit_events.entry_hash")?)),
            None => Ok((0, [0u8; 32])),
        }
    }

    fn load_rows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(StoredRow {
                seq: row.get::<_, i64>(0)? as u64,
                session_seq: row.get::<_, i64>(1)? as u64,
                payload_json: row.get(2)?,
                prev_hash: row.get(3)?,
                entry_hash: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

struct StoredRow {
    seq: u64,
    session_seq: u64,
    payload_json: String,
    prev_hash: Vec<u8>,
    entry_hash: Vec<u8>,
}

impl StoredRow {
    fn into_event(self) -> Result<AuditEvent> {
        let body: serde_json::Value = serde_json::from_str(&self.payload_json)?;
        let record: AuditRecord = serde_json::from_value(
            body.get("record")
                .cloned()
                .ok_or_else(|| anyhow!("audit row {} has no record", self.seq))?,
        )?;
        Ok(AuditEvent {
            seq: self.seq,
            session_seq: self.session_seq,
            summary: record.summary(),
            record,
            prev_hash: hex::encode(blob32(self.prev_hash, "audit_events.prev_hash")?),
            entry_hash: hex::encode(blob32(self.entry_hash, "audit_events.entry_hash")?),
        })
    }
}

const SELECT_ROWS: &str =
    "SELECT seq, session_seq, payload_json, prev_hash, entry_hash FROM audit_events";

impl AuditStore for SqliteAuditStore {
    fn append(&mut self, record: &AuditRecord, session_seq: u64) -> Result<AuditEvent> {
        let (last_seq, prev_hash) = self.last_entry()?;
        let seq = last_seq + 1;
        let (event, payload) = seal(seq, session_seq, record, prev_hash)?;
        let entry_hash = blob32(hex::decode(&event.entry_hash)?, "entry_hash")?;

        self.conn
            .execute(
                r#"
                INSERT INTO audit_events(
                  seq, session_id, session_seq, created_at_ms, kind, summary,
                  decision, rule, outcome, error, payload_json, prev_hash, entry_hash
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    seq as i64,
                    record.session_id,
                    session_seq as i64,
                    record.timestamp_ms as i64,
                    record.kind.as_str(),
                    event.summary,
                    record.decision.map(|d| d.as_str()),
                    record.rule,
                    record.outcome.as_str(),
                    record.error,
                    payload,
                    prev_hash.to_vec(),
                    entry_hash.to_vec(),
                ],
            )
            .map_err(|e| GateError::AuditWrite(e.to_string()))?;
        Ok(event)
    }

    fn session_head(&self, session_id: &str) -> Result<u64> {
        let head: Option<i64> = self.conn.query_row(
            "SELECT MAX(session_seq) FROM audit_events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(head.unwrap_or(0) as u64)
    }

    fn events(&self, query: &EventQuery) -> Result<Vec<AuditEvent>> {
        let after = query.after_seq.unwrap_or(0) as i64;
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = match &query.session_id {
            Some(session) => self.load_rows(
                &format!(
                    "{} WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
                    SELECT_ROWS
                ),
                &[session, &after, &limit],
            )?,
            None => self.load_rows(
                &format!("{} WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2", SELECT_ROWS),
                &[&after, &limit],
            )?,
        };
        rows.into_iter().map(StoredRow::into_event).collect()
    }

    fn verify_chain(&self) -> Result<ChainReport> {
        let rows = self.load_rows(&format!("{} ORDER BY seq ASC", SELECT_ROWS), &[])?;
        let mut prev = [0u8; 32];
        let mut count = 0u64;
        for row in rows {
            let event = row.into_event()?;
            prev = check_link(&event, &prev)?;
            count += 1;
        }
        Ok(ChainReport {
            events: count,
            head: hex::encode(prev),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryAuditStore {
    events: Vec<AuditEvent>,
}

impl AuditStore for InMemoryAuditStore {
    fn append(&mut self, record: &AuditRecord, session_seq: u64) -> Result<AuditEvent> {
        let prev_hash = match self.events.last() {
            Some(last) => blob32(hex::decode(&last.entry_hash)?, "entry_hash")?,
            None => [0u8; 32],
        };
        let seq = self.events.len() as u64 + 1;
        let (event, _) = seal(seq, session_seq, record, prev_hash)?;
        self.events.push(event.clone());
        Ok(event)
    }

    fn session_head(&self, session_id: &str) -> Result<u64> {
        Ok(self
            .events
            .iter()
            .filter(|event| event.record.session_id == session_id)
            .map(|event| event.session_seq)
            .max()
            .unwrap_or(0))
    }

    fn events(&self, query: &EventQuery) -> Result<Vec<AuditEvent>> {
        let matching = self
            .events
            .iter()
            .filter(|event| matches_query(event, query))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    fn verify_chain(&self) -> Result<ChainReport> {
        let mut prev = [0u8; 32];
        for event in &self.events {
            prev = check_link(event, &prev)?;
        }
        Ok(ChainReport {
            events: self.events.len() as u64,
            head: hex::encode(prev),
        })
    }
}

fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
