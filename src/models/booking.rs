use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use super::appointment::Appointment;
use super::business::BusinessProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotName {
    Service,
    Date,
    Time,
}

impl SlotName {
    pub const ALL: [SlotName; 3] = [SlotName::Service, SlotName::Date, SlotName::Time];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotName::Service => "service",
            SlotName::Date => "date",
            SlotName::Time => "time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Unset,
    Tentative,
    Confirmed,
}

/// One field of a booking request. A value is present exactly when the state is not `Unset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<T> {
    value: Option<T>,
    state: SlotState,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            state: SlotState::Unset,
        }
    }
}

impl<T> Slot<T> {
    pub fn tentative(value: T) -> Self {
        Self {
            value: Some(value),
            state: SlotState::Tentative,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_filled(&self) -> bool {
        self.state != SlotState::Unset
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == SlotState::Confirmed
    }

    pub fn set_tentative(&mut self, value: T) {
        self.value = Some(value);
        self.state = SlotState::Tentative;
    }

    pub fn confirm(&mut self) {
        if self.value.is_some() {
            self.state = SlotState::Confirmed;
        }
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.state = SlotState::Unset;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub service: Slot<String>,
    pub date: Slot<NaiveDate>,
    pub time: Slot<NaiveTime>,
}

impl BookingRequest {
    pub fn state_of(&self, slot: SlotName) -> SlotState {
        match slot {
            SlotName::Service => self.service.state(),
            SlotName::Date => self.date.state(),
            SlotName::Time => self.time.state(),
        }
    }

    pub fn is_filled(&self, slot: SlotName) -> bool {
        self.state_of(slot) != SlotState::Unset
    }

    pub fn missing(&self) -> Vec<SlotName> {
        SlotName::ALL
            .into_iter()
            .filter(|s| !self.is_filled(*s))
            .collect()
    }

    /// Every slot carries a value, tentative or confirmed.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn all_confirmed(&self) -> bool {
        SlotName::ALL
            .into_iter()
            .all(|s| self.state_of(s) == SlotState::Confirmed)
    }

    pub fn confirm_all(&mut self) {
        self.service.confirm();
        self.date.confirm();
        self.time.confirm();
    }

    pub fn clear(&mut self, slot: SlotName) {
        match slot {
            SlotName::Service => self.service.clear(),
            SlotName::Date => self.date.clear(),
            SlotName::Time => self.time.clear(),
        }
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        Some(self.date.value()?.and_time(*self.time.value()?))
    }

    /// Start and end of the requested interval, with the duration taken from the catalog.
    pub fn interval(&self, profile: &BusinessProfile) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let start = self.start()?;
        let duration: Duration = profile.duration_for(self.service.value()?)?;
        Some((start, start + duration))
    }

    pub fn is_finalizable(&self, profile: &BusinessProfile) -> bool {
        self.all_confirmed()
            && self
                .interval(profile)
                .map(|(start, end)| profile.hours.fits(&start, &end))
                .unwrap_or(false)
    }

    /// Converts a finalizable request into the appointment that would be written.
    pub fn to_appointment(
        &self,
        customer: &str,
        profile: &BusinessProfile,
        created_at: NaiveDateTime,
    ) -> Option<Appointment> {
        if !self.is_finalizable(profile) {
            return None;
        }
        let service = profile.service(self.service.value()?)?;
        let start = self.start()?;
        Some(Appointment::new(
            customer,
            &service.name,
            start,
            service.duration(),
            created_at,
        ))
    }

    pub fn describe(&self) -> String {
        let service = self
            .service
            .value()
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "appointment".to_string());
        let mut text = article_for(&service).to_string() + " " + &service;
        if let Some(date) = self.date.value() {
            text.push_str(&format!(" on {}", date.format("%Y-%m-%d")));
        }
        if let Some(time) = self.time.value() {
            text.push_str(&format!(" at {}", time.format("%H:%M")));
        }
        text
    }
}

fn article_for(noun: &str) -> &'static str {
    match noun.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
        _ => "a",
    }
}
