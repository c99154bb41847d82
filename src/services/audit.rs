use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::db::queries;
use crate::models::{SessionSnapshot, TransitionEvent};

/// Sink for state transitions and finished sessions. Failures are logged, never returned.
pub trait AuditLog: Send + Sync {
    fn record_transition(&self, event: &TransitionEvent);
    fn archive_session(&self, snapshot: &SessionSnapshot);
}

/// Logs through `tracing` only.
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record_transition(&self, event: &TransitionEvent) {
        log_transition(event);
    }

    fn archive_session(&self, snapshot: &SessionSnapshot) {
        log_archive(snapshot);
    }
}

pub struct SqliteAuditLog {
    db: Arc<Mutex<Connection>>,
}

impl SqliteAuditLog {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let conn = self
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("audit database lock poisoned"))?;
        f(&conn)
    }
}

impl AuditLog for SqliteAuditLog {
    fn record_transition(&self, event: &TransitionEvent) {
        log_transition(event);
        if let Err(e) = self.with_conn(|conn| queries::insert_transition(conn, event)) {
            tracing::warn!(session_id = %event.session_id, error = %e, "failed to persist transition");
        }
    }

    fn archive_session(&self, snapshot: &SessionSnapshot) {
        log_archive(snapshot);
        if let Err(e) = self.with_conn(|conn| queries::archive_session(conn, snapshot)) {
            tracing::warn!(session_id = %snapshot.id, error = %e, "failed to archive session");
        }
    }
}

fn log_transition(event: &TransitionEvent) {
    tracing::info!(
        session_id = %event.session_id,
        prior = event.prior.as_str(),
        new = event.new.as_str(),
        reason = %event.reason,
        "session transition"
    );
}

fn log_archive(snapshot: &SessionSnapshot) {
    tracing::info!(
        session_id = %snapshot.id,
        customer = %snapshot.customer,
        phase = snapshot.phase.as_str(),
        escalation = snapshot.escalation.map(|r| r.as_str()).unwrap_or("none"),
        turns = snapshot.history.len(),
        "session finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::Phase;
    use chrono::NaiveDateTime;

    #[test]
    fn test_sqlite_audit_persists_transitions() {
        let db = Arc::new(Mutex::new(db::init_db(":memory:").unwrap()));
        let audit = SqliteAuditLog::new(db.clone());
        audit.record_transition(&TransitionEvent {
            session_id: "s1".to_string(),
            prior: Phase::Collecting,
            new: Phase::Escalated,
            reason: "UPSTREAM_FAILURE".to_string(),
            at: NaiveDateTime::parse_from_str("2024-06-10 09:00", "%Y-%m-%d %H:%M").unwrap(),
        });

        let conn = db.lock().unwrap();
        let events = queries::transitions_for_session(&conn, "s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new, Phase::Escalated);
    }

    #[test]
    fn test_audit_failure_is_swallowed() {
        let db = Arc::new(Mutex::new(db::init_db(":memory:").unwrap()));
        db.lock()
            .unwrap()
            .execute_batch("DROP TABLE transition_events;")
            .unwrap();
        let audit = SqliteAuditLog::new(db);
        audit.record_transition(&TransitionEvent {
            session_id: "s1".to_string(),
            prior: Phase::Collecting,
            new: Phase::Confirming,
            reason: "request complete".to_string(),
            at: NaiveDateTime::default(),
        });
    }
}
