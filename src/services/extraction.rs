use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::Serialize;

use crate::errors::BookingError;
use crate::models::{BookingRequest, BusinessHours, BusinessProfile, Slot, SlotName, SlotState};
use crate::services::ai::{FieldGuess, InterpretContext, Interpretation, Interpreter};
use crate::services::usage::UsageGuard;

const AFFIRM_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "correct", "ok", "okay", "confirm", "confirmed",
    "perfect", "great", "fine", "absolutely", "definitely",
];
const AFFIRM_PHRASES: &[&str] = &["sounds good", "that works", "works for me", "go ahead", "book it"];
const DENY_WORDS: &[&str] = &["no", "nope", "nah", "wrong", "incorrect", "neither"];
const DENY_PHRASES: &[&str] = &[
    "not right", "not correct", "doesn't work", "does not work", "that's wrong", "not quite",
    "don't want", "none of",
];

const HOURS_TERMS: &[&str] = &["hours", "open", "close", "closing", "closed"];
const PRICE_TERMS: &[&str] = &["price", "prices", "cost", "costs", "charge", "how much"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Deterministic,
    Interpreter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate<T> {
    pub value: T,
    pub confidence: f32,
    pub source: Source,
}

impl<T> Candidate<T> {
    fn exact(value: T) -> Self {
        Self {
            value,
            confidence: 1.0,
            source: Source::Deterministic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoTopic {
    Hours,
    Pricing,
}

/// Everything read from one utterance. Deciding what to do with it is the session's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotUpdateProposal {
    pub service: Option<Candidate<String>>,
    pub date: Option<Candidate<NaiveDate>>,
    pub time: Option<Candidate<NaiveTime>>,
    /// `Some(true)` yes, `Some(false)` no, `None` neither or both.
    pub affirmation: Option<bool>,
    /// Zero-based pick among offered alternatives.
    pub choice: Option<usize>,
    pub mentioned: Vec<SlotName>,
    pub info: Option<InfoTopic>,
    /// Fields the interpreter returned but that could not be read.
    pub ambiguous: Vec<SlotName>,
    /// The interpreter was skipped because the usage guard denied it.
    pub degraded: bool,
    pub tokens_used: u64,
}

impl SlotUpdateProposal {
    pub fn has_values(&self) -> bool {
        self.service.is_some() || self.date.is_some() || self.time.is_some()
    }

    pub fn provides(&self, slot: SlotName) -> bool {
        match slot {
            SlotName::Service => self.service.is_some(),
            SlotName::Date => self.date.is_some(),
            SlotName::Time => self.time.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Previously unset slots that now hold a value.
    pub updated: Vec<SlotName>,
    /// Filled slots whose value changed.
    pub corrected: Vec<SlotName>,
    /// Slots left unset because the reading was below the confidence threshold.
    pub ambiguous: Vec<SlotName>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.updated.is_empty() || !self.corrected.is_empty()
    }
}

/// Applies a proposal to a request.
///
/// Unset and tentative slots take any candidate at or above `threshold`. A confirmed slot
/// only gives way to a deterministic reading that contradicts it, and then drops back to
/// tentative so it gets read back again. Readings below the threshold clear the slot
/// (unless confirmed) and are reported as ambiguous.
pub fn merge(request: &mut BookingRequest, proposal: &SlotUpdateProposal, threshold: f32) -> MergeReport {
    let mut report = MergeReport::default();
    merge_slot(&mut request.service, proposal.service.as_ref(), SlotName::Service, threshold, &mut report);
    merge_slot(&mut request.date, proposal.date.as_ref(), SlotName::Date, threshold, &mut report);
    merge_slot(&mut request.time, proposal.time.as_ref(), SlotName::Time, threshold, &mut report);

    for slot in &proposal.ambiguous {
        if request.state_of(*slot) != SlotState::Confirmed {
            request.clear(*slot);
        }
        if !report.ambiguous.contains(slot) {
            report.ambiguous.push(*slot);
        }
    }
    report
}

fn merge_slot<T: Clone + PartialEq>(
    slot: &mut Slot<T>,
    candidate: Option<&Candidate<T>>,
    name: SlotName,
    threshold: f32,
    report: &mut MergeReport,
) {
    let Some(candidate) = candidate else {
        return;
    };

    if candidate.confidence < threshold {
        if !slot.is_confirmed() {
            slot.clear();
        }
        report.ambiguous.push(name);
        return;
    }

    let differs = slot.value() != Some(&candidate.value);
    if slot.is_confirmed() {
        if differs && candidate.source == Source::Deterministic {
            slot.set_tentative(candidate.value.clone());
            report.corrected.push(name);
        }
    } else if !slot.is_filled() {
        slot.set_tentative(candidate.value.clone());
        report.updated.push(name);
    } else if differs {
        slot.set_tentative(candidate.value.clone());
        report.corrected.push(name);
    }
}

pub struct SlotExtractor {
    profile: Arc<BusinessProfile>,
    interpreter: Option<Arc<dyn Interpreter>>,
    guard: Arc<dyn UsageGuard>,
    timeout: StdDuration,
    retries: u32,
}

impl SlotExtractor {
    pub fn new(
        profile: Arc<BusinessProfile>,
        interpreter: Option<Arc<dyn Interpreter>>,
        guard: Arc<dyn UsageGuard>,
        timeout: StdDuration,
    ) -> Self {
        Self {
            profile,
            interpreter,
            guard,
            timeout,
            retries: 1,
        }
    }

    /// Pure parsing and catalog lookup; never calls out.
    pub fn extract_deterministic(&self, utterance: &str, today: NaiveDate) -> SlotUpdateProposal {
        let text = normalize(utterance);
        let words: Vec<&str> = text.split_whitespace().collect();

        SlotUpdateProposal {
            service: match_service(&text, &self.profile).map(Candidate::exact),
            date: parse_date(&text, &words, today).map(Candidate::exact),
            time: parse_time(&words, &self.profile.hours).map(Candidate::exact),
            affirmation: parse_affirmation(&text, &words),
            choice: parse_choice(&words),
            mentioned: parse_mentions(&words),
            info: parse_info(&text, &words),
            ..Default::default()
        }
    }

    /// Deterministic pass, then the interpreter for whatever is still missing.
    ///
    /// Interpreter timeouts fail at once; other interpreter errors are retried before failing.
    /// When the usage guard denies the call the proposal is returned degraded, unless nothing
    /// at all could be read, which fails too.
    pub async fn extract(
        &self,
        session_id: &str,
        utterance: &str,
        request: &BookingRequest,
        today: NaiveDate,
    ) -> Result<SlotUpdateProposal, BookingError> {
        let mut proposal = self.extract_deterministic(utterance, today);

        let still_missing: Vec<SlotName> = request
            .missing()
            .into_iter()
            .filter(|s| !proposal.provides(*s))
            .collect();

        let Some(interpreter) = self.interpreter.as_ref() else {
            return Ok(proposal);
        };
        if still_missing.is_empty() || is_reply_only(&proposal) {
            return Ok(proposal);
        }

        if !self.guard.allow() {
            tracing::warn!(session_id, "usage guard denied interpretation");
            proposal.degraded = true;
            if proposal.has_values() {
                return Ok(proposal);
            }
            return Err(BookingError::ExtractionFailed("usage limit reached".to_string()));
        }

        let context = self.context_for(request, still_missing, today);
        let mut last_error = String::new();

        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, interpreter.interpret(utterance, &context)).await {
                Err(_) => {
                    tracing::warn!(session_id, attempt, "interpretation timed out");
                    return Err(BookingError::ExtractionFailed("interpretation timed out".to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id, attempt, error = %e, "interpretation failed");
                    last_error = e.to_string();
                }
                Ok(Ok(interpretation)) => {
                    self.guard.record(session_id, interpretation.tokens_used);
                    self.absorb(&mut proposal, interpretation);
                    return Ok(proposal);
                }
            }
        }

        Err(BookingError::ExtractionFailed(last_error))
    }

    fn context_for(&self, request: &BookingRequest, missing: Vec<SlotName>, today: NaiveDate) -> InterpretContext {
        let known = if request.is_filled(SlotName::Service)
            || request.is_filled(SlotName::Date)
            || request.is_filled(SlotName::Time)
        {
            request.describe()
        } else {
            String::new()
        };

        InterpretContext {
            today,
            missing,
            known,
            services: self.profile.service_names(),
            hours: self.profile.hours.to_human_readable(),
        }
    }

    /// Folds interpreter guesses into fields the deterministic pass left empty.
    fn absorb(&self, proposal: &mut SlotUpdateProposal, interpretation: Interpretation) {
        proposal.tokens_used += interpretation.tokens_used;

        if proposal.service.is_none() {
            if let Some(guess) = interpretation.service {
                match self.profile.service(&guess.value) {
                    Some(def) => proposal.service = Some(guessed(def.name.clone(), &guess)),
                    None => proposal.ambiguous.push(SlotName::Service),
                }
            }
        }

        if proposal.date.is_none() {
            if let Some(guess) = interpretation.date {
                match NaiveDate::parse_from_str(&guess.value, "%Y-%m-%d") {
                    Ok(date) => proposal.date = Some(guessed(date, &guess)),
                    Err(_) => proposal.ambiguous.push(SlotName::Date),
                }
            }
        }

        if proposal.time.is_none() {
            if let Some(guess) = interpretation.time {
                let parsed = NaiveTime::parse_from_str(&guess.value, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(&guess.value, "%H:%M:%S"));
                match parsed {
                    Ok(time) => proposal.time = Some(guessed(time, &guess)),
                    Err(_) => proposal.ambiguous.push(SlotName::Time),
                }
            }
        }
    }
}

fn guessed<T>(value: T, guess: &FieldGuess) -> Candidate<T> {
    Candidate {
        value,
        confidence: guess.confidence,
        source: Source::Interpreter,
    }
}

/// A bare yes/no, pick or question carries nothing worth paying the interpreter for.
fn is_reply_only(proposal: &SlotUpdateProposal) -> bool {
    !proposal.has_values()
        && (proposal.affirmation.is_some() || proposal.choice.is_some() || proposal.info.is_some())
}

fn normalize(utterance: &str) -> String {
    let lowered = utterance
        .to_lowercase()
        .replace("a.m.", "am")
        .replace("p.m.", "pm")
        .replace('’', "'");

    lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ':' | '-' | '\'' | '+') {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    format!(" {} ", text.split_whitespace().collect::<Vec<_>>().join(" "))
        .contains(&format!(" {phrase} "))
}

fn match_service(text: &str, profile: &BusinessProfile) -> Option<String> {
    profile
        .services
        .iter()
        .flat_map(|s| s.terms().map(move |term| (term, s)))
        .filter(|(term, _)| contains_phrase(text, term))
        .max_by_key(|(term, _)| term.len())
        .map(|(_, s)| s.name.clone())
}

fn parse_date(text: &str, words: &[&str], today: NaiveDate) -> Option<NaiveDate> {
    if contains_phrase(text, "day after tomorrow") {
        return Some(today + Duration::days(2));
    }
    if words.contains(&"tomorrow") {
        return Some(today + Duration::days(1));
    }
    if words.contains(&"today") {
        return Some(today);
    }
    if let Some(date) = words
        .iter()
        .find_map(|w| NaiveDate::parse_from_str(w, "%Y-%m-%d").ok())
    {
        return Some(date);
    }
    words
        .iter()
        .find_map(|w| weekday_from(w))
        .map(|day| next_weekday(today, day))
}

fn weekday_from(word: &str) -> Option<Weekday> {
    match word {
        "monday" => Some(Weekday::Mon),
        "tuesday" | "tues" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" | "thurs" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Next occurrence strictly after `today`.
fn next_weekday(today: NaiveDate, day: Weekday) -> NaiveDate {
    let ahead = (day.num_days_from_monday() as i64 - today.weekday().num_days_from_monday() as i64 + 7) % 7;
    today + Duration::days(if ahead == 0 { 7 } else { ahead })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Meridiem {
    Am,
    Pm,
}

fn split_meridiem(word: &str) -> (&str, Option<Meridiem>) {
    if let Some(rest) = word.strip_suffix("am") {
        (rest, Some(Meridiem::Am))
    } else if let Some(rest) = word.strip_suffix("pm") {
        (rest, Some(Meridiem::Pm))
    } else {
        (word, None)
    }
}

fn parse_clock(s: &str) -> Option<(u32, u32)> {
    match s.split_once(':') {
        Some((h, m)) if m.len() == 2 => Some((h.parse().ok()?, m.parse().ok()?)),
        Some(_) => None,
        None if !s.is_empty() && s.len() <= 2 => Some((s.parse().ok()?, 0)),
        None => None,
    }
}

fn with_meridiem(hour: u32, minute: u32, meridiem: Meridiem) -> Option<NaiveTime> {
    if !(1..=12).contains(&hour) {
        return None;
    }
    let hour = match meridiem {
        Meridiem::Am => hour % 12,
        Meridiem::Pm => hour % 12 + 12,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Reads an hour with no am/pm as whichever half of the day the business is open.
fn resolve_bare_hour(hour: u32, minute: u32, hours: &BusinessHours) -> Option<NaiveTime> {
    if hour == 0 || hour > 12 {
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }
    let open = |t: &NaiveTime| *t >= hours.open && *t < hours.close;
    let am = with_meridiem(hour, minute, Meridiem::Am)?;
    let pm = with_meridiem(hour, minute, Meridiem::Pm)?;
    // noon reads as 12:00 either way
    let (am, pm) = if hour == 12 { (pm, pm) } else { (am, pm) };
    if open(&am) {
        Some(am)
    } else if open(&pm) {
        Some(pm)
    } else {
        Some(am)
    }
}

fn parse_time(words: &[&str], hours: &BusinessHours) -> Option<NaiveTime> {
    if words.iter().any(|w| matches!(*w, "noon" | "midday")) {
        return NaiveTime::from_hms_opt(12, 0, 0);
    }

    for (i, word) in words.iter().enumerate() {
        let (digits, mut meridiem) = split_meridiem(word);
        if meridiem.is_none() {
            meridiem = match words.get(i + 1) {
                Some(&"am") => Some(Meridiem::Am),
                Some(&"pm") => Some(Meridiem::Pm),
                _ => None,
            };
        }
        let Some((hour, minute)) = parse_clock(digits) else {
            continue;
        };
        let has_colon = digits.contains(':');

        let time = match meridiem {
            Some(m) => with_meridiem(hour, minute, m),
            None if has_colon => resolve_bare_hour(hour, minute, hours),
            None => {
                let after_cue = i > 0 && matches!(words[i - 1], "at" | "around" | "by" | "about");
                if after_cue {
                    resolve_bare_hour(hour, minute, hours)
                } else {
                    None
                }
            }
        };
        if time.is_some() {
            return time;
        }
    }

    None
}

fn parse_affirmation(text: &str, words: &[&str]) -> Option<bool> {
    if DENY_PHRASES.iter().any(|p| contains_phrase(text, p)) {
        return Some(false);
    }
    let yes = words.iter().any(|w| AFFIRM_WORDS.contains(w))
        || AFFIRM_PHRASES.iter().any(|p| contains_phrase(text, p));
    let no = words.iter().any(|w| DENY_WORDS.contains(w));
    match (yes, no) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

fn parse_choice(words: &[&str]) -> Option<usize> {
    for (i, word) in words.iter().enumerate() {
        let ordinal = match *word {
            "first" | "1st" => Some(0),
            "second" | "2nd" => Some(1),
            "third" | "3rd" => Some(2),
            "fourth" | "4th" => Some(3),
            "option" | "number" | "choice" => words
                .get(i + 1)
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n >= 1)
                .map(|n| n - 1),
            _ => None,
        };
        if ordinal.is_some() {
            return ordinal;
        }
    }
    None
}

fn parse_mentions(words: &[&str]) -> Vec<SlotName> {
    let mut mentioned = Vec::new();
    for word in words {
        let slot = match *word {
            "service" => Some(SlotName::Service),
            "date" | "day" => Some(SlotName::Date),
            "time" | "hour" => Some(SlotName::Time),
            _ => None,
        };
        if let Some(slot) = slot {
            if !mentioned.contains(&slot) {
                mentioned.push(slot);
            }
        }
    }
    mentioned
}

fn parse_info(text: &str, words: &[&str]) -> Option<InfoTopic> {
    let asks = |terms: &[&str]| terms.iter().any(|t| words.contains(t) || contains_phrase(text, t));
    if asks(PRICE_TERMS) {
        Some(InfoTopic::Pricing)
    } else if asks(HOURS_TERMS) {
        Some(InfoTopic::Hours)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::usage::Unmetered;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    // 2024-06-09 is a Sunday
    fn today() -> NaiveDate {
        date("2024-06-09")
    }

    fn extractor(interpreter: Option<Arc<dyn Interpreter>>) -> SlotExtractor {
        SlotExtractor::new(
            Arc::new(BusinessProfile::default()),
            interpreter,
            Arc::new(Unmetered),
            StdDuration::from_millis(200),
        )
    }

    struct CountingInterpreter {
        calls: AtomicUsize,
        reply: Option<Interpretation>,
        delay: Option<StdDuration>,
    }

    impl CountingInterpreter {
        fn replying(reply: Interpretation) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Some(reply),
                delay: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: None,
                delay: None,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Some(Interpretation::default()),
                delay: Some(StdDuration::from_secs(5)),
            })
        }
    }

    #[async_trait]
    impl Interpreter for CountingInterpreter {
        async fn interpret(&self, _utterance: &str, _context: &InterpretContext) -> anyhow::Result<Interpretation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    struct DenyAll;

    impl UsageGuard for DenyAll {
        fn allow(&self) -> bool {
            false
        }
        fn record(&self, _session_id: &str, _tokens: u64) {}
    }

    #[test]
    fn test_tomorrow_at_two() {
        let p = extractor(None).extract_deterministic("tomorrow at 2", today());
        assert_eq!(p.date.as_ref().unwrap().value, date("2024-06-10"));
        assert_eq!(p.date.as_ref().unwrap().source, Source::Deterministic);
        assert_eq!(p.time.as_ref().unwrap().value, time("14:00"));
        assert_eq!(p.time.as_ref().unwrap().confidence, 1.0);
        assert!(p.service.is_none());
    }

    #[test]
    fn test_explicit_times() {
        let e = extractor(None);
        let cases = [
            ("at 14:30", "14:30"),
            ("10am please", "10:00"),
            ("3:15 pm", "15:15"),
            ("around 9", "09:00"),
            ("at noon", "12:00"),
            ("at 11:30", "11:30"),
            ("at 4:30", "16:30"),
        ];
        for (utterance, expected) in cases {
            let p = e.extract_deterministic(utterance, today());
            assert_eq!(p.time.map(|c| c.value), Some(time(expected)), "{utterance}");
        }
    }

    #[test]
    fn test_number_without_cue_is_not_a_time() {
        let p = extractor(None).extract_deterministic("I have 2 cars", today());
        assert!(p.time.is_none());
    }

    #[test]
    fn test_dates() {
        let e = extractor(None);
        let cases = [
            ("today", "2024-06-09"),
            ("the day after tomorrow", "2024-06-11"),
            ("on 2024-07-01", "2024-07-01"),
            ("next friday", "2024-06-14"),
            ("sunday", "2024-06-16"),
        ];
        for (utterance, expected) in cases {
            let p = e.extract_deterministic(utterance, today());
            assert_eq!(p.date.map(|c| c.value), Some(date(expected)), "{utterance}");
        }
    }

    #[test]
    fn test_service_longest_match_wins() {
        let p = extractor(None).extract_deterministic("I need a Brake Inspection", today());
        assert_eq!(p.service.unwrap().value, "Brake Inspection");
        let p = extractor(None).extract_deterministic("just an oil change, thanks", today());
        assert_eq!(p.service.unwrap().value, "Oil Change");
    }

    #[test]
    fn test_affirmation_and_denial() {
        let e = extractor(None);
        assert_eq!(e.extract_deterministic("Yes, that's right", today()).affirmation, Some(true));
        assert_eq!(e.extract_deterministic("sounds good", today()).affirmation, Some(true));
        assert_eq!(e.extract_deterministic("no", today()).affirmation, Some(false));
        assert_eq!(e.extract_deterministic("that's not right", today()).affirmation, Some(false));
        assert_eq!(e.extract_deterministic("yes no", today()).affirmation, None);
        assert_eq!(e.extract_deterministic("hmm", today()).affirmation, None);
    }

    #[test]
    fn test_choice_mentions_and_info() {
        let e = extractor(None);
        assert_eq!(e.extract_deterministic("the second one", today()).choice, Some(1));
        assert_eq!(e.extract_deterministic("option 1", today()).choice, Some(0));
        assert_eq!(
            e.extract_deterministic("change the time", today()).mentioned,
            vec![SlotName::Time]
        );
        assert_eq!(e.extract_deterministic("what are your hours?", today()).info, Some(InfoTopic::Hours));
        assert_eq!(
            e.extract_deterministic("how much is an oil change", today()).info,
            Some(InfoTopic::Pricing)
        );
    }

    #[test]
    fn test_merge_fills_unset_and_overwrites_tentative() {
        let mut request = BookingRequest::default();
        let p = extractor(None).extract_deterministic("oil change tomorrow at 2", today());
        let report = merge(&mut request, &p, 0.6);
        assert_eq!(report.updated, SlotName::ALL.to_vec());
        assert!(request.is_complete());

        let p = extractor(None).extract_deterministic("actually at 3pm", today());
        let report = merge(&mut request, &p, 0.6);
        assert_eq!(report.corrected, vec![SlotName::Time]);
        assert_eq!(request.time.value(), Some(&time("15:00")));
    }

    #[test]
    fn test_merge_confirmed_only_yields_to_deterministic_contradiction() {
        let mut request = BookingRequest::default();
        request.time.set_tentative(time("14:00"));
        request.time.confirm();

        let guess = SlotUpdateProposal {
            time: Some(Candidate {
                value: time("15:00"),
                confidence: 0.9,
                source: Source::Interpreter,
            }),
            ..Default::default()
        };
        let report = merge(&mut request, &guess, 0.6);
        assert!(!report.changed());
        assert!(request.time.is_confirmed());

        let explicit = extractor(None).extract_deterministic("make it 15:00", today());
        let report = merge(&mut request, &explicit, 0.6);
        assert_eq!(report.corrected, vec![SlotName::Time]);
        assert_eq!(request.time.state(), SlotState::Tentative);
    }

    #[test]
    fn test_merge_low_confidence_leaves_slot_unset() {
        let mut request = BookingRequest::default();
        let guess = SlotUpdateProposal {
            service: Some(Candidate {
                value: "Oil Change".to_string(),
                confidence: 0.3,
                source: Source::Interpreter,
            }),
            ..Default::default()
        };
        let report = merge(&mut request, &guess, 0.6);
        assert_eq!(report.ambiguous, vec![SlotName::Service]);
        assert_eq!(request.state_of(SlotName::Service), SlotState::Unset);
    }

    #[tokio::test]
    async fn test_deterministic_fields_skip_interpreter() {
        let interp = CountingInterpreter::replying(Interpretation::default());
        let e = extractor(Some(interp.clone()));
        let p = e
            .extract("s1", "oil change tomorrow at 2", &BookingRequest::default(), today())
            .await
            .unwrap();
        assert!(p.service.is_some() && p.date.is_some() && p.time.is_some());
        assert_eq!(interp.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interpreter_fills_free_form_service() {
        let interp = CountingInterpreter::replying(Interpretation {
            service: Some(FieldGuess {
                value: "tire rotation".to_string(),
                confidence: 0.85,
            }),
            tokens_used: 120,
            ..Default::default()
        });
        let e = extractor(Some(interp.clone()));
        let p = e
            .extract("s1", "my wheels need swapping around tomorrow at 10", &BookingRequest::default(), today())
            .await
            .unwrap();
        let service = p.service.unwrap();
        assert_eq!(service.value, "Tire Rotation");
        assert_eq!(service.source, Source::Interpreter);
        assert_eq!(p.tokens_used, 120);
        assert_eq!(interp.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_guess_is_ambiguous() {
        let interp = CountingInterpreter::replying(Interpretation {
            service: Some(FieldGuess {
                value: "flux capacitor tune".to_string(),
                confidence: 0.9,
            }),
            ..Default::default()
        });
        let p = extractor(Some(interp))
            .extract("s1", "the thingy needs fixing", &BookingRequest::default(), today())
            .await
            .unwrap();
        assert!(p.service.is_none());
        assert_eq!(p.ambiguous, vec![SlotName::Service]);
    }

    #[tokio::test]
    async fn test_interpreter_error_retried_once_then_fails() {
        let interp = CountingInterpreter::failing();
        let err = extractor(Some(interp.clone()))
            .extract("s1", "something about my car", &BookingRequest::default(), today())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::ExtractionFailed(_)));
        assert_eq!(interp.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interpreter_timeout_fails_without_retry() {
        let interp = CountingInterpreter::hanging();
        let err = extractor(Some(interp.clone()))
            .extract("s1", "something about my car", &BookingRequest::default(), today())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::ExtractionFailed(msg) if msg.contains("timed out")));
        assert_eq!(interp.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_denial_degrades_or_fails() {
        let interp = CountingInterpreter::replying(Interpretation::default());
        let e = SlotExtractor::new(
            Arc::new(BusinessProfile::default()),
            Some(interp.clone()),
            Arc::new(DenyAll),
            StdDuration::from_millis(200),
        );

        let p = e
            .extract("s1", "tomorrow please", &BookingRequest::default(), today())
            .await
            .unwrap();
        assert!(p.degraded);
        assert!(p.date.is_some());

        let err = e
            .extract("s1", "something about my car", &BookingRequest::default(), today())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::ExtractionFailed(_)));
        assert_eq!(interp.calls.load(Ordering::SeqCst), 0);
    }
}
