use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub customer: String,
    pub service: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl Appointment {
    pub fn new(
        customer: &str,
        service: &str,
        start: NaiveDateTime,
        duration: Duration,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            customer: customer.to_string(),
            service: service.to_string(),
            start,
            end: start + duration,
            created_at,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Same customer, start and service: a retried write of the same booking.
    pub fn same_booking(&self, other: &Appointment) -> bool {
        self.customer == other.customer
            && self.start == other.start
            && self.service.eq_ignore_ascii_case(&other.service)
    }

    /// Closed-open overlap; touching endpoints do not conflict.
    pub fn overlaps(&self, start: &NaiveDateTime, end: &NaiveDateTime) -> bool {
        self.start < *end && *start < self.end
    }

    pub fn summary(&self) -> String {
        format!("{} for {}", self.service, self.customer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternativeSlot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AlternativeSlot {
    pub fn at(start: NaiveDateTime) -> Self {
        Self {
            date: start.date(),
            time: start.time(),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    pub fn describe(&self) -> String {
        format!("{} at {}", self.date.format("%Y-%m-%d"), self.time.format("%H:%M"))
    }
}
