use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{FixedOffset, NaiveDateTime};

use crate::models::{Appointment, BusinessProfile};
use crate::services::calendar::{self, IcsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// Identical (customer, start, service) already stored; nothing was written.
    AlreadyBooked { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("appointment overlaps existing booking {0}")]
    Overlap(String),

    #[error("invalid appointment: {0}")]
    Invalid(String),

    #[error("calendar persistence failed: {0}")]
    Persistence(String),

    #[error("calendar file is corrupt: {0}")]
    Corrupt(#[from] IcsError),
}

pub trait CalendarStore: Send + Sync {
    /// Writes one appointment. Check and write happen under the same held lock, so of
    /// two overlapping writers only the first succeeds.
    fn write(&self, appointment: &Appointment) -> Result<WriteOutcome, StoreError>;

    /// Appointments whose interval intersects `[start, end)`, ordered by start.
    fn list_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError>;

    fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        Ok(self.list_all()?.into_iter().find(|a| a.id == id))
    }
}

/// Decides what a write of `candidate` does against the committed set.
pub fn check_insert(
    existing: &[Appointment],
    candidate: &Appointment,
) -> Result<Option<WriteOutcome>, StoreError> {
    if candidate.start >= candidate.end {
        return Err(StoreError::Invalid(format!(
            "start {} is not before end {}",
            candidate.start, candidate.end
        )));
    }
    if let Some(dup) = existing.iter().find(|a| a.same_booking(candidate)) {
        return Ok(Some(WriteOutcome::AlreadyBooked { id: dup.id.clone() }));
    }
    if let Some(clash) = existing
        .iter()
        .find(|a| a.overlaps(&candidate.start, &candidate.end))
    {
        return Err(StoreError::Overlap(clash.id.clone()));
    }
    Ok(None)
}

/// Calendar backed by a single `.ics` file, which stays the source of truth:
/// every operation re-reads it, and writes replace it atomically.
pub struct IcsCalendarStore {
    path: PathBuf,
    offset: FixedOffset,
    shop_name: String,
    lock: Mutex<()>,
}

impl IcsCalendarStore {
    pub fn open(path: &Path, profile: &BusinessProfile) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create calendar directory: {}", parent.display()))?;
        }

        let store = Self {
            path: path.to_path_buf(),
            offset: profile.offset(),
            shop_name: profile.shop_name.clone(),
            lock: Mutex::new(()),
        };

        // Fail at start-up rather than mid-call on an unreadable calendar.
        let existing = store
            .load()
            .with_context(|| format!("failed to load calendar: {}", path.display()))?;
        tracing::info!(path = %path.display(), appointments = existing.len(), "calendar loaded");

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<Appointment>, StoreError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Persistence(format!("read {}: {e}", self.path.display())))?;
        Ok(calendar::parse_calendar(&text, &self.offset)?)
    }

    fn save(&self, appointments: &[Appointment]) -> Result<(), StoreError> {
        let text = calendar::render_calendar(appointments, &self.offset, &self.shop_name);
        let tmp = self.path.with_extension("ics.tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| StoreError::Persistence(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            StoreError::Persistence(format!("replace {}: {e}", self.path.display()))
        })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Persistence("calendar lock poisoned".to_string()))
    }
}

impl CalendarStore for IcsCalendarStore {
    fn write(&self, appointment: &Appointment) -> Result<WriteOutcome, StoreError> {
        let _held = self.guard()?;

        let mut appointments = self.load()?;
        if let Some(outcome) = check_insert(&appointments, appointment)? {
            tracing::info!(id = %appointment.id, "duplicate appointment write ignored");
            return Ok(outcome);
        }

        appointments.push(appointment.clone());
        appointments.sort_by_key(|a| a.start);
        self.save(&appointments)?;

        tracing::info!(
            id = %appointment.id,
            service = %appointment.service,
            start = %appointment.start,
            "appointment written"
        );
        Ok(WriteOutcome::Created)
    }

    fn list_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError> {
        let _held = self.guard()?;
        Ok(self
            .load()?
            .into_iter()
            .filter(|a| a.overlaps(&start, &end))
            .collect())
    }

    fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        let _held = self.guard()?;
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn temp_store() -> IcsCalendarStore {
        let path = std::env::temp_dir().join(format!("receptionist-{}.ics", uuid::Uuid::new_v4()));
        IcsCalendarStore::open(&path, &BusinessProfile::default()).unwrap()
    }

    fn appointment(customer: &str, start: &str, minutes: i64) -> Appointment {
        Appointment::new(
            customer,
            "Oil Change",
            dt(start),
            Duration::minutes(minutes),
            dt("2024-06-01 08:00"),
        )
    }

    #[test]
    fn test_write_and_list_between() {
        let store = temp_store();
        store.write(&appointment("+1", "2024-06-10 14:00", 30)).unwrap();
        store.write(&appointment("+2", "2024-06-10 10:00", 30)).unwrap();
        store.write(&appointment("+3", "2024-06-11 10:00", 30)).unwrap();

        let day = store
            .list_between(dt("2024-06-10 00:00"), dt("2024-06-11 00:00"))
            .unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].customer, "+2");
        assert_eq!(day[1].customer, "+1");
    }

    #[test]
    fn test_duplicate_write_is_idempotent() {
        let store = temp_store();
        let first = appointment("+1", "2024-06-10 14:00", 30);
        let retry = appointment("+1", "2024-06-10 14:00", 30);

        assert_eq!(store.write(&first).unwrap(), WriteOutcome::Created);
        assert_eq!(
            store.write(&retry).unwrap(),
            WriteOutcome::AlreadyBooked { id: first.id.clone() }
        );
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_overlapping_write_rejected() {
        let store = temp_store();
        let first = appointment("+1", "2024-06-10 14:00", 60);
        store.write(&first).unwrap();

        let err = store.write(&appointment("+2", "2024-06-10 14:30", 30)).unwrap_err();
        assert!(matches!(err, StoreError::Overlap(id) if id == first.id));

        // touching the end is fine
        store.write(&appointment("+2", "2024-06-10 15:00", 30)).unwrap();
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let store = temp_store();
        let err = store.write(&appointment("+1", "2024-06-10 14:00", 0)).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_store_survives_reopen() {
        let store = temp_store();
        let written = appointment("+1", "2024-06-10 14:00", 30);
        store.write(&written).unwrap();

        let reopened = IcsCalendarStore::open(store.path(), &BusinessProfile::default()).unwrap();
        assert_eq!(reopened.get(&written.id).unwrap(), Some(written));
    }

    #[test]
    fn test_concurrent_writers_never_overlap() {
        let store = Arc::new(temp_store());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.write(&appointment(&format!("+{i}"), "2024-06-10 14:00", 30))
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| matches!(r, Ok(WriteOutcome::Created)))
            .count();
        assert_eq!(created, 1);

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
    }
}
