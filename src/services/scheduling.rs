use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::errors::BookingError;
use crate::models::{AlternativeSlot, Appointment, BusinessProfile, SlotName};
use crate::services::calendar_store::{CalendarStore, StoreError};
use crate::services::clock::Clock;

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictCheck {
    Clear,
    /// Candidate overlaps a committed appointment. `alternatives` may be empty.
    Conflict { alternatives: Vec<AlternativeSlot> },
}

/// Checks candidates against the committed calendar and the opening hours, and
/// searches forward for free slots when they collide.
pub struct AvailabilityResolver {
    store: Arc<dyn CalendarStore>,
    profile: Arc<BusinessProfile>,
    clock: Arc<dyn Clock>,
}

impl AvailabilityResolver {
    pub fn new(store: Arc<dyn CalendarStore>, profile: Arc<BusinessProfile>, clock: Arc<dyn Clock>) -> Self {
        Self { store, profile, clock }
    }

    fn interval(&self) -> Duration {
        Duration::minutes(self.profile.booking_slots.interval_minutes)
    }

    /// First step boundary strictly after now.
    fn earliest_start(&self) -> NaiveDateTime {
        let now = self.clock.now();
        let step = self.profile.booking_slots.interval_minutes.max(1);
        let elapsed = i64::from(now.hour() * 60 + now.minute());
        let midnight = now.date().and_hms_opt(0, 0, 0).unwrap_or(now);
        midnight + Duration::minutes((elapsed / step + 1) * step)
    }

    /// Rejects a date before today, or a start at or before the current time.
    pub fn check_upcoming(&self, date: NaiveDate, start: Option<NaiveDateTime>) -> Result<(), BookingError> {
        let now = self.clock.now();
        if date < now.date() {
            return Err(BookingError::BusinessHoursViolation {
                slot: SlotName::Date,
                message: "That date has already passed. What day works for you?".to_string(),
            });
        }
        match start {
            Some(start) if start <= now => Err(BookingError::BusinessHoursViolation {
                slot: SlotName::Time,
                message: "That time has already passed today. What later time works for you?".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Rejects intervals that do not sit inside one business day's opening hours.
    pub fn check_hours(&self, start: &NaiveDateTime, end: &NaiveDateTime) -> Result<(), BookingError> {
        let hours = &self.profile.hours;
        if hours.fits(start, end) {
            return Ok(());
        }

        let (slot, message) = if !hours.is_business_day(start.date()) {
            (
                SlotName::Date,
                format!(
                    "Sorry, we're closed on {}s. We're open {}. What other day works for you?",
                    start.format("%A"),
                    hours.to_human_readable()
                ),
            )
        } else {
            (
                SlotName::Time,
                format!(
                    "That time is outside our business hours. We're open {}. What time works for you?",
                    hours.to_human_readable()
                ),
            )
        };
        Err(BookingError::BusinessHoursViolation { slot, message })
    }

    pub fn check_conflict(&self, candidate: &Appointment) -> Result<ConflictCheck, StoreError> {
        let clashes = self
            .store
            .list_between(candidate.start, candidate.end)?
            .into_iter()
            .filter(|a| !a.same_booking(candidate))
            .count();

        if clashes == 0 {
            return Ok(ConflictCheck::Clear);
        }

        tracing::info!(
            start = %candidate.start,
            service = %candidate.service,
            clashes,
            "requested slot is taken"
        );

        let alternatives = self.alternatives_from(candidate.start + self.interval(), candidate.duration())?;
        Ok(ConflictCheck::Conflict { alternatives })
    }

    /// Earliest free slots of length `duration` starting at or after `from`, stepping by the
    /// configured interval, staying within opening hours and the search horizon. Nothing
    /// before the current time is ever offered.
    pub fn alternatives_from(
        &self,
        from: NaiveDateTime,
        duration: Duration,
    ) -> Result<Vec<AlternativeSlot>, StoreError> {
        let from = from.max(self.earliest_start());
        let hours = &self.profile.hours;
        let settings = &self.profile.booking_slots;
        let limit = settings.max_alternatives;
        let step = self.interval();

        let first_day = from.date();
        let last_day = first_day + Duration::days(settings.horizon_days);
        if limit == 0 || duration <= Duration::zero() || step <= Duration::zero() {
            return Ok(vec![]);
        }

        let taken = self
            .store
            .list_between(hours.opening(first_day), hours.closing(last_day))?;

        let mut found = Vec::new();
        let mut day = first_day;
        while day <= last_day && found.len() < limit {
            if hours.is_business_day(day) {
                let opening = hours.opening(day);
                let mut cursor = if day == first_day && from > opening { from } else { opening };
                let closing = hours.closing(day);

                while cursor + duration <= closing && found.len() < limit {
                    let end = cursor + duration;
                    if hours.fits(&cursor, &end) && !taken.iter().any(|a| a.overlaps(&cursor, &end)) {
                        found.push(AlternativeSlot::at(cursor));
                    }
                    cursor += step;
                }
            }
            day += Duration::days(1);
        }

        Ok(found)
    }
}
