use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

use crate::models::{Phase, SessionSnapshot, TransitionEvent};

const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

fn fmt_ts(dt: &NaiveDateTime) -> String {
    dt.format(TIMESTAMP).to_string()
}

fn parse_ts(s: &str) -> anyhow::Result<NaiveDateTime> {
    Ok(NaiveDateTime::parse_from_str(s, TIMESTAMP)?)
}

// ── Usage Ledger ──

pub fn record_usage(
    conn: &Connection,
    session_id: &str,
    tokens: u64,
    at: &NaiveDateTime,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO usage_ledger (session_id, tokens, recorded_at) VALUES (?1, ?2, ?3)",
        params![session_id, tokens as i64, fmt_ts(at)],
    )?;
    Ok(())
}

pub fn total_tokens(conn: &Connection) -> anyhow::Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(tokens), 0) FROM usage_ledger",
        [],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

pub fn session_tokens(conn: &Connection, session_id: &str) -> anyhow::Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(tokens), 0) FROM usage_ledger WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

// ── Transition Events ──

pub fn insert_transition(conn: &Connection, event: &TransitionEvent) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO transition_events (session_id, prior_phase, new_phase, reason, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.session_id,
            event.prior.as_str(),
            event.new.as_str(),
            event.reason,
            fmt_ts(&event.at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn transitions_for_session(
    conn: &Connection,
    session_id: &str,
) -> anyhow::Result<Vec<TransitionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, prior_phase, new_phase, reason, occurred_at
         FROM transition_events WHERE session_id = ?1 ORDER BY id ASC",
    )?;

    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut events = vec![];
    for row in rows {
        let (session_id, prior, new, reason, at) = row?;
        events.push(TransitionEvent {
            session_id,
            prior: parse_phase(&prior)?,
            new: parse_phase(&new)?,
            reason,
            at: parse_ts(&at)?,
        });
    }
    Ok(events)
}

fn parse_phase(s: &str) -> anyhow::Result<Phase> {
    Phase::parse(s).ok_or_else(|| anyhow::anyhow!("unknown phase in database: {s}"))
}

// ── Session Archive ──

pub fn archive_session(conn: &Connection, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
    let data = serde_json::to_string(snapshot)?;
    conn.execute(
        "INSERT INTO call_sessions (id, customer, phase, escalation, appointment_id, snapshot, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            phase = excluded.phase,
            escalation = excluded.escalation,
            appointment_id = excluded.appointment_id,
            snapshot = excluded.snapshot,
            updated_at = excluded.updated_at",
        params![
            snapshot.id,
            snapshot.customer,
            snapshot.phase.as_str(),
            snapshot.escalation.map(|r| r.as_str()),
            snapshot.appointment.as_ref().map(|a| a.id.as_str()),
            data,
            fmt_ts(&snapshot.created_at),
            fmt_ts(&snapshot.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_archived_session(conn: &Connection, id: &str) -> anyhow::Result<Option<SessionSnapshot>> {
    let result = conn.query_row(
        "SELECT snapshot FROM call_sessions WHERE id = ?1",
        params![id],
        |row| row.get::<_, String>(0),
    );

    match result {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn count_sessions_by_phase(conn: &Connection, phase: Phase) -> anyhow::Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM call_sessions WHERE phase = ?1",
        params![phase.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}
