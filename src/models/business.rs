use std::path::Path;

use anyhow::Context;
use chrono::{
    Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

const DAY_ORDER: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("invalid weekday: {0}")]
    Weekday(String),

    #[error("invalid time format: {0}")]
    Time(String),

    #[error("opening time {open} must be before closing time {close}")]
    HoursOrder { open: String, close: String },

    #[error("at least one service must be defined")]
    NoServices,

    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("service {0} must have a positive duration")]
    Duration(String),

    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("utc offset out of range: {0} minutes")]
    Offset(i32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    #[serde(default = "default_duration")]
    pub duration_minutes: i64,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ServiceDef {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }

    /// Lowercased name followed by aliases, for matching against free text.
    pub fn terms(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.name.to_lowercase()).chain(self.aliases.iter().map(|a| a.to_lowercase()))
    }
}

fn default_duration() -> i64 {
    30
}

/// Raw `HH:MM` / weekday form of the opening hours as written in the profile JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursConfig {
    pub open: String,
    pub close: String,
    #[serde(default = "default_days")]
    pub days: Vec<String>,
}

fn default_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HoursConfig", into = "HoursConfig")]
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub days: Vec<Weekday>,
}

impl TryFrom<HoursConfig> for BusinessHours {
    type Error = ProfileError;

    fn try_from(raw: HoursConfig) -> Result<Self, Self::Error> {
        let open = parse_time(&raw.open)?;
        let close = parse_time(&raw.close)?;
        if open >= close {
            return Err(ProfileError::HoursOrder {
                open: raw.open,
                close: raw.close,
            });
        }
        let mut days = raw
            .days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<_>, _>>()?;
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Ok(Self { open, close, days })
    }
}

impl From<BusinessHours> for HoursConfig {
    fn from(hours: BusinessHours) -> Self {
        Self {
            open: hours.open.format("%H:%M").to_string(),
            close: hours.close.format("%H:%M").to_string(),
            days: hours
                .days
                .iter()
                .map(|d| d.to_string().to_lowercase())
                .collect(),
        }
    }
}

impl BusinessHours {
    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.days.contains(&date.weekday())
    }

    /// Start instant falls on a business day within `[open, close)`.
    pub fn is_open_at(&self, dt: &NaiveDateTime) -> bool {
        self.is_business_day(dt.date()) && dt.time() >= self.open && dt.time() < self.close
    }

    /// Whole interval `[start, end)` lies inside one business day's opening hours.
    pub fn fits(&self, start: &NaiveDateTime, end: &NaiveDateTime) -> bool {
        start < end
            && self.is_open_at(start)
            && end.date() == start.date()
            && end.time() <= self.close
    }

    pub fn opening(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.open)
    }

    pub fn closing(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.close)
    }

    pub fn to_human_readable(&self) -> String {
        if self.days.is_empty() {
            return String::new();
        }

        let days = DAY_ORDER
            .iter()
            .filter(|d| self.days.contains(d))
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{days} {}-{}",
            self.open.format("%H:%M"),
            self.close.format("%H:%M")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_interval")]
    pub interval_minutes: i64,
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    #[serde(default = "default_horizon")]
    pub horizon_days: i64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval(),
            max_alternatives: default_max_alternatives(),
            horizon_days: default_horizon(),
        }
    }
}

fn default_interval() -> i64 {
    30
}

fn default_max_alternatives() -> usize {
    2
}

fn default_horizon() -> i64 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(default = "default_max_clarifications")]
    pub max_clarifications: u32,
    #[serde(default = "default_max_offer_rounds")]
    pub max_offer_rounds: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_clarifications: default_max_clarifications(),
            max_offer_rounds: default_max_offer_rounds(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_max_clarifications() -> u32 {
    3
}

fn default_max_offer_rounds() -> u32 {
    2
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_shop_name() -> String {
    "Superior Auto Clinic".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessProfile {
    #[serde(default = "default_shop_name")]
    pub shop_name: String,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    pub services: Vec<ServiceDef>,
    pub hours: BusinessHours,
    #[serde(default)]
    pub booking_slots: SearchSettings,
    #[serde(default)]
    pub policy: SessionPolicy,
}

impl Default for BusinessProfile {
    fn default() -> Self {
        let service = |name: &str, minutes: i64, price: &str, aliases: &[&str]| ServiceDef {
            name: name.to_string(),
            duration_minutes: minutes,
            price: Some(price.to_string()),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        };

        Self {
            shop_name: default_shop_name(),
            utc_offset_minutes: 0,
            services: vec![
                service("Oil Change", 30, "$79.99", &["oil"]),
                service("Tire Rotation", 45, "$49.99", &["tires", "tyre rotation"]),
                service("Brake Inspection", 60, "$89.99", &["brakes", "brake check"]),
            ],
            hours: BusinessHours {
                open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
                close: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
                days: DAY_ORDER[..5].to_vec(),
            },
            booking_slots: SearchSettings::default(),
            policy: SessionPolicy::default(),
        }
    }
}

impl BusinessProfile {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let profile: BusinessProfile = serde_json::from_str(s)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Reads the profile from disk, falling back to the built-in default when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "business profile not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read business profile: {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("invalid business profile: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.services.is_empty() {
            return Err(ProfileError::NoServices);
        }
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ProfileError::EmptyServiceName);
            }
            if service.duration_minutes <= 0 {
                return Err(ProfileError::Duration(service.name.clone()));
            }
        }
        if self.booking_slots.interval_minutes <= 0 {
            return Err(ProfileError::NonPositive("booking_slots.interval_minutes"));
        }
        if self.booking_slots.horizon_days < 0 {
            return Err(ProfileError::NonPositive("booking_slots.horizon_days"));
        }
        if self.policy.max_clarifications == 0 {
            return Err(ProfileError::NonPositive("policy.max_clarifications"));
        }
        if self.checked_offset().is_none() {
            return Err(ProfileError::Offset(self.utc_offset_minutes));
        }
        Ok(())
    }

    fn checked_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    pub fn offset(&self) -> FixedOffset {
        self.checked_offset().unwrap_or_else(|| Utc.fix())
    }

    /// Case-insensitive lookup by canonical name or alias.
    pub fn service(&self, name: &str) -> Option<&ServiceDef> {
        let needle = name.trim().to_lowercase();
        self.services
            .iter()
            .find(|s| s.terms().any(|t| t == needle))
    }

    pub fn duration_for(&self, service: &str) -> Option<Duration> {
        self.service(service).map(|s| s.duration())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }
}

fn parse_weekday(s: &str) -> Result<Weekday, ProfileError> {
    match s.trim().to_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        _ => Err(ProfileError::Weekday(s.to_string())),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, ProfileError> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].len() != 2 {
        return Err(ProfileError::Time(s.to_string()));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| ProfileError::Time(s.to_string()))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| ProfileError::Time(s.to_string()))?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| ProfileError::Time(s.to_string()))
}
