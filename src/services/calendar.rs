use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::models::Appointment;

const UTC_STAMP: &str = "%Y%m%dT%H%M%SZ";
const FLOATING_STAMP: &str = "%Y%m%dT%H%M%S";
const FOLD_AT: usize = 75;
const UID_SUFFIX: &str = "@receptionist";
const X_CUSTOMER: &str = "X-RECEPTIONIST-CUSTOMER";
const X_SERVICE: &str = "X-RECEPTIONIST-SERVICE";

#[derive(Debug, thiserror::Error)]
pub enum IcsError {
    #[error("invalid timestamp in {property}: {value}")]
    Timestamp { property: String, value: String },

    #[error("event {0} is missing {1}")]
    MissingProperty(String, &'static str),

    #[error("unterminated VEVENT")]
    Unterminated,
}

/// Renders a whole calendar. Times are written in UTC so the file stays unambiguous.
pub fn render_calendar(appointments: &[Appointment], offset: &FixedOffset, shop_name: &str) -> String {
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//Receptionist//Booking Engine//EN".to_string(),
        "CALSCALE:GREGORIAN".to_string(),
        format!("X-WR-CALNAME:{}", escape_text(shop_name)),
    ];
    for appointment in appointments {
        lines.extend(event_lines(appointment, offset, shop_name));
    }
    lines.push("END:VCALENDAR".to_string());

    let mut out = String::new();
    for line in lines {
        out.push_str(&fold_line(&line));
        out.push_str("\r\n");
    }
    out
}

pub fn render_event(appointment: &Appointment, offset: &FixedOffset, shop_name: &str) -> String {
    render_calendar(std::slice::from_ref(appointment), offset, shop_name)
}

fn event_lines(appointment: &Appointment, offset: &FixedOffset, shop_name: &str) -> Vec<String> {
    let description = format!(
        "Booked service: {}\nCustomer: {}\nBooked with {}",
        appointment.service, appointment.customer, shop_name
    );
    vec![
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}{UID_SUFFIX}", appointment.id),
        format!("DTSTAMP:{}", to_utc_stamp(&appointment.created_at, offset)),
        format!("DTSTART:{}", to_utc_stamp(&appointment.start, offset)),
        format!("DTEND:{}", to_utc_stamp(&appointment.end, offset)),
        format!("SUMMARY:{}", escape_text(&appointment.summary())),
        format!("DESCRIPTION:{}", escape_text(&description)),
        format!("{X_CUSTOMER}:{}", escape_text(&appointment.customer)),
        format!("{X_SERVICE}:{}", escape_text(&appointment.service)),
        "END:VEVENT".to_string(),
    ]
}

/// Parses every VEVENT back into an appointment in business-local time.
///
/// Events written by other calendar applications are accepted as long as they
/// carry DTSTART and DTEND; customer and service then come from the summary.
pub fn parse_calendar(text: &str, offset: &FixedOffset) -> Result<Vec<Appointment>, IcsError> {
    let mut appointments = Vec::new();
    let mut current: Option<Vec<(String, String)>> = None;

    for line in unfold(text) {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(Vec::new());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            let props = current.take().ok_or(IcsError::Unterminated)?;
            appointments.push(event_from_props(&props, offset)?);
            continue;
        }
        if let Some(props) = current.as_mut() {
            if let Some((name, value)) = split_property(&line) {
                props.push((name, value));
            }
        }
    }

    if current.is_some() {
        return Err(IcsError::Unterminated);
    }

    appointments.sort_by_key(|a| a.start);
    Ok(appointments)
}

fn event_from_props(props: &[(String, String)], offset: &FixedOffset) -> Result<Appointment, IcsError> {
    let get = |name: &str| {
        props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    let uid = get("UID").unwrap_or_default();
    let id = uid.strip_suffix(UID_SUFFIX).unwrap_or(uid).to_string();
    let label = if id.is_empty() { "<no uid>".to_string() } else { id.clone() };

    let start = get("DTSTART").ok_or_else(|| IcsError::MissingProperty(label.clone(), "DTSTART"))?;
    let end = get("DTEND").ok_or_else(|| IcsError::MissingProperty(label.clone(), "DTEND"))?;
    let start = from_stamp("DTSTART", start, offset)?;
    let end = from_stamp("DTEND", end, offset)?;
    let created_at = match get("DTSTAMP") {
        Some(v) => from_stamp("DTSTAMP", v, offset)?,
        None => start,
    };

    let summary = get("SUMMARY").map(unescape_text).unwrap_or_default();
    let (summary_service, summary_customer) = match summary.split_once(" for ") {
        Some((service, customer)) => (service.to_string(), customer.to_string()),
        None => (summary.clone(), String::new()),
    };

    Ok(Appointment {
        id: if id.is_empty() { uuid::Uuid::new_v4().to_string() } else { id },
        customer: get(X_CUSTOMER).map(unescape_text).unwrap_or(summary_customer),
        service: get(X_SERVICE).map(unescape_text).unwrap_or(summary_service),
        start,
        end,
        created_at,
    })
}

/// Property name without parameters (`DTSTART;TZID=...` -> `DTSTART`) and its raw value.
fn split_property(line: &str) -> Option<(String, String)> {
    let (head, value) = line.split_once(':')?;
    let name = head.split(';').next().unwrap_or(head).to_ascii_uppercase();
    Some((name, value.to_string()))
}

fn to_utc_stamp(local: &NaiveDateTime, offset: &FixedOffset) -> String {
    match offset.from_local_datetime(local).single() {
        Some(dt) => dt.with_timezone(&Utc).format(UTC_STAMP).to_string(),
        None => local.format(FLOATING_STAMP).to_string(),
    }
}

/// UTC stamps are converted to the business offset; floating and TZID-qualified
/// stamps are taken to already be business-local.
fn from_stamp(property: &str, value: &str, offset: &FixedOffset) -> Result<NaiveDateTime, IcsError> {
    let value = value.trim();
    let bad = || IcsError::Timestamp {
        property: property.to_string(),
        value: value.to_string(),
    };

    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, FLOATING_STAMP).map_err(|_| bad())?;
        return Ok(Utc.from_utc_datetime(&naive).with_timezone(offset).naive_local());
    }
    NaiveDateTime::parse_from_str(value, FLOATING_STAMP).map_err(|_| bad())
}

pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits a content line into 75-octet pieces, never inside a UTF-8 sequence.
fn fold_line(line: &str) -> String {
    if line.len() <= FOLD_AT {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + line.len() / FOLD_AT * 3);
    let mut width = 0;
    let mut limit = FOLD_AT;
    for c in line.chars() {
        if width + c.len_utf8() > limit {
            out.push_str("\r\n ");
            width = 0;
            // continuation lines spend one octet on the leading space
            limit = FOLD_AT - 1;
        }
        out.push(c);
        width += c.len_utf8();
    }
    out
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}
