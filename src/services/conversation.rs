use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::errors::BookingError;
use crate::models::{
    AlternativeSlot, Appointment, BookingRequest, BusinessProfile, EscalationReason, Phase, ResponseKind,
    SessionSnapshot, SlotName, SystemResponse, TransitionEvent, Turn,
};
use crate::services::ai::Interpreter;
use crate::services::audit::AuditLog;
use crate::services::calendar_store::{CalendarStore, WriteOutcome};
use crate::services::clock::Clock;
use crate::services::escalation;
use crate::services::extraction::{merge, InfoTopic, MergeReport, SlotExtractor, SlotUpdateProposal};
use crate::services::scheduling::{AvailabilityResolver, ConflictCheck};
use crate::services::usage::UsageGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Incomplete,
    RequestComplete,
    Corrected,
    Unclear,
    HoursViolation,
    SlotTaken,
    OfferDeclined,
    AlternativeSelected,
    Committed,
    Escalate(EscalationReason),
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Incomplete => "incomplete",
            Event::RequestComplete => "request_complete",
            Event::Corrected => "corrected",
            Event::Unclear => "unclear",
            Event::HoursViolation => "hours_violation",
            Event::SlotTaken => "slot_taken",
            Event::OfferDeclined => "offer_declined",
            Event::AlternativeSelected => "alternative_selected",
            Event::Committed => "committed",
            Event::Escalate(reason) => reason.as_str(),
        }
    }
}

/// The session state machine. `None` means the event is not allowed in that phase;
/// terminal phases allow nothing.
pub fn next_phase(from: Phase, event: Event) -> Option<Phase> {
    use Phase::*;

    match (from, event) {
        (Escalated | Completed, _) => None,
        (_, Event::Escalate(_)) => Some(Escalated),

        (Collecting, Event::Incomplete) => Some(Collecting),
        (Collecting, Event::HoursViolation) => Some(Collecting),
        (Collecting, Event::RequestComplete) => Some(Confirming),

        (Confirming, Event::Corrected) => Some(Collecting),
        (Confirming, Event::HoursViolation) => Some(Collecting),
        (Confirming, Event::Unclear) => Some(Confirming),
        (Confirming, Event::SlotTaken) => Some(ResolvingConflict),
        (Confirming, Event::Committed) => Some(Completed),

        (ResolvingConflict, Event::OfferDeclined) => Some(ResolvingConflict),
        (ResolvingConflict, Event::AlternativeSelected) => Some(Confirming),
        (ResolvingConflict, Event::Corrected) => Some(Collecting),

        _ => None,
    }
}

/// Reply to an utterance sent to a session that has already ended.
pub fn rejected(phase: Phase) -> SystemResponse {
    SystemResponse::new(
        ResponseKind::Rejected,
        phase,
        "This call has already been wrapped up. Please start a new call if you need anything else.",
    )
}

/// Collaborators shared by every session.
pub struct BookingEngine {
    pub profile: Arc<BusinessProfile>,
    pub extractor: SlotExtractor,
    pub resolver: AvailabilityResolver,
    pub store: Arc<dyn CalendarStore>,
    pub audit: Arc<dyn AuditLog>,
    pub clock: Arc<dyn Clock>,
}

impl BookingEngine {
    pub fn new(
        profile: Arc<BusinessProfile>,
        store: Arc<dyn CalendarStore>,
        interpreter: Option<Arc<dyn Interpreter>>,
        guard: Arc<dyn UsageGuard>,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
        interpret_timeout: StdDuration,
    ) -> Self {
        Self {
            extractor: SlotExtractor::new(profile.clone(), interpreter, guard, interpret_timeout),
            resolver: AvailabilityResolver::new(store.clone(), profile.clone(), clock.clone()),
            profile,
            store,
            audit,
            clock,
        }
    }

    pub fn greeting(&self) -> String {
        format!(
            "Thanks for calling {}. What can I book for you today?",
            self.profile.shop_name
        )
    }
}

pub struct CallSession {
    engine: Arc<BookingEngine>,
    id: String,
    customer: String,
    phase: Phase,
    request: BookingRequest,
    history: Vec<Turn>,
    escalation: Option<EscalationReason>,
    appointment: Option<Appointment>,
    /// Slots named in the last prompt.
    awaiting: Vec<SlotName>,
    clarifications: HashMap<SlotName, u32>,
    confirm_attempts: u32,
    /// The customer said no to the read-back without saying what to change.
    pending_change: bool,
    offers: Vec<AlternativeSlot>,
    offer_rounds: u32,
    created_at: chrono::NaiveDateTime,
    updated_at: chrono::NaiveDateTime,
}

impl CallSession {
    pub fn new(engine: Arc<BookingEngine>, customer: &str) -> Self {
        let now = engine.clock.now();
        Self {
            engine,
            id: uuid::Uuid::new_v4().to_string(),
            customer: customer.to_string(),
            phase: Phase::Collecting,
            request: BookingRequest::default(),
            history: vec![],
            escalation: None,
            appointment: None,
            awaiting: vec![],
            clarifications: HashMap::new(),
            confirm_attempts: 0,
            pending_change: false,
            offers: vec![],
            offer_rounds: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn customer(&self) -> &str {
        &self.customer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn request(&self) -> &BookingRequest {
        &self.request
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            customer: self.customer.clone(),
            phase: self.phase,
            request: self.request.clone(),
            history: self.history.clone(),
            escalated: self.escalation.is_some(),
            escalation: self.escalation,
            appointment: self.appointment.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Runs one turn. Never fails: every internal error ends up as a transition and a
    /// customer-facing message.
    pub async fn handle(&mut self, utterance: &str) -> SystemResponse {
        let utterance = utterance.trim();
        tracing::info!(session_id = %self.id, phase = self.phase.as_str(), utterance, "inbound utterance");

        let response = match self.phase {
            Phase::Collecting => self.on_collecting(utterance).await,
            Phase::Confirming => self.on_confirming(utterance),
            Phase::ResolvingConflict => self.on_resolving(utterance),
            Phase::Escalated | Phase::Completed => {
                tracing::info!(session_id = %self.id, phase = self.phase.as_str(), "utterance after session ended");
                return rejected(self.phase);
            }
        };

        self.updated_at = self.engine.clock.now();
        self.history.push(Turn {
            utterance: utterance.to_string(),
            response: response.text.clone(),
            at: self.updated_at,
        });

        if self.phase.is_terminal() {
            self.engine.audit.archive_session(&self.snapshot());
        }

        response
    }

    async fn on_collecting(&mut self, utterance: &str) -> SystemResponse {
        let today = self.engine.clock.today();
        let extracted = self
            .engine
            .extractor
            .extract(&self.id, utterance, &self.request, today)
            .await;
        let proposal = match extracted {
            Ok(proposal) => proposal,
            Err(e) => return self.fail(e),
        };
        if proposal.degraded {
            tracing::info!(session_id = %self.id, "continuing on deterministic extraction only");
        }

        let threshold = self.engine.profile.policy.confidence_threshold;
        let report = merge(&mut self.request, &proposal, threshold);

        if self.pending_change {
            return self.on_pending_change(&proposal, &report);
        }

        if !report.changed() && report.ambiguous.is_empty() {
            if let Some(topic) = proposal.info {
                return self.answer_info(topic);
            }
        }

        if let Err(e) = self.check_request_hours() {
            return self.fail(e);
        }
        self.advance_collecting(&report)
    }

    /// Follow-up to a bare "no" at read-back.
    fn on_pending_change(&mut self, proposal: &SlotUpdateProposal, report: &MergeReport) -> SystemResponse {
        if report.changed() {
            self.pending_change = false;
            if let Err(e) = self.check_request_hours() {
                return self.fail(e);
            }
            return self.advance_collecting(report);
        }

        if !proposal.mentioned.is_empty() {
            self.pending_change = false;
            for slot in &proposal.mentioned {
                self.request.clear(*slot);
            }
            return self.advance_collecting(report);
        }

        if proposal.affirmation == Some(true) {
            // nothing to change after all
            self.pending_change = false;
            return self.advance_collecting(report);
        }

        self.confirm_attempts += 1;
        if self.confirm_attempts >= self.engine.profile.policy.max_clarifications {
            return self.escalate(EscalationReason::LowConfidenceExhausted);
        }
        self.transition(Event::Incomplete);
        SystemResponse::new(
            ResponseKind::Prompt,
            self.phase,
            "Sorry, which part should I change: the service, the date, or the time?",
        )
    }

    fn advance_collecting(&mut self, report: &MergeReport) -> SystemResponse {
        if self.request.is_complete() {
            self.awaiting.clear();
            self.confirm_attempts = 0;
            self.transition(Event::RequestComplete);
            return self.confirm_prompt("");
        }

        // A turn that filled or corrected something does not count against the slots
        // it left open.
        let max = self.engine.profile.policy.max_clarifications;
        let unanswered: &[SlotName] = if report.changed() { &[] } else { &self.awaiting };
        let mut unclear: Vec<SlotName> = unanswered
            .iter()
            .chain(report.ambiguous.iter())
            .copied()
            .filter(|s| !self.request.is_filled(*s))
            .collect();
        unclear.sort();
        unclear.dedup();

        for slot in &unclear {
            let attempts = self.clarifications.entry(*slot).or_insert(0);
            *attempts += 1;
            tracing::info!(session_id = %self.id, slot = slot.as_str(), attempts = *attempts, "clarification needed");
            if *attempts >= max {
                return self.escalate(EscalationReason::LowConfidenceExhausted);
            }
        }

        self.transition(Event::Incomplete);
        self.awaiting = self.request.missing();

        let prefix = match report.ambiguous.first() {
            Some(slot) => format!("Sorry, I didn't quite catch the {}. ", slot.as_str()),
            None if report.changed() => format!("Got it, {}. ", self.request.describe()),
            None => String::new(),
        };
        self.missing_prompt(&prefix)
    }

    fn on_confirming(&mut self, utterance: &str) -> SystemResponse {
        let proposal = self
            .engine
            .extractor
            .extract_deterministic(utterance, self.engine.clock.today());

        if proposal.has_values() {
            let threshold = self.engine.profile.policy.confidence_threshold;
            let report = merge(&mut self.request, &proposal, threshold);
            if report.changed() {
                self.transition(Event::Corrected);
                if let Err(e) = self.check_request_hours() {
                    return self.fail(e);
                }
                return self.advance_collecting(&report);
            }
        }

        match proposal.affirmation {
            Some(true) => {
                self.request.confirm_all();
                self.finalize()
            }
            _ if !proposal.mentioned.is_empty() && proposal.info.is_none() => {
                for slot in &proposal.mentioned {
                    self.request.clear(*slot);
                }
                self.transition(Event::Corrected);
                self.awaiting = self.request.missing();
                self.missing_prompt("No problem. ")
            }
            Some(false) => {
                self.pending_change = true;
                self.transition(Event::Corrected);
                SystemResponse::new(
                    ResponseKind::Prompt,
                    self.phase,
                    "No problem. What would you like to change: the service, the date, or the time?",
                )
            }
            None => {
                if let Some(topic) = proposal.info {
                    return self.answer_info(topic);
                }
                self.confirm_attempts += 1;
                if self.confirm_attempts >= self.engine.profile.policy.max_clarifications {
                    return self.escalate(EscalationReason::LowConfidenceExhausted);
                }
                self.transition(Event::Unclear);
                self.confirm_prompt("Sorry, I didn't catch that. ")
            }
        }
    }

    fn on_resolving(&mut self, utterance: &str) -> SystemResponse {
        let proposal = self
            .engine
            .extractor
            .extract_deterministic(utterance, self.engine.clock.today());

        let new_service = proposal
            .service
            .as_ref()
            .is_some_and(|c| self.request.service.value() != Some(&c.value));
        if new_service {
            return self.change_service(&proposal);
        }

        if let Some(pick) = self.pick_offer(&proposal) {
            return self.accept(pick);
        }

        if proposal.date.is_some() || proposal.time.is_some() {
            return self.counter_offer(&proposal);
        }

        if proposal.affirmation.is_none() {
            if let Some(topic) = proposal.info {
                return self.answer_info(topic);
            }
        }

        self.offer_rounds += 1;
        if self.offer_rounds >= self.engine.profile.policy.max_offer_rounds {
            return self.fail(BookingError::NoAlternativesAvailable);
        }

        let (Some(last), Some((start, end))) = (self.offers.last().copied(), self.request.interval(&self.engine.profile))
        else {
            return self.fail(BookingError::NoAlternativesAvailable);
        };
        let step = Duration::minutes(self.engine.profile.booking_slots.interval_minutes);
        match self.engine.resolver.alternatives_from(last.start() + step, end - start) {
            Ok(alternatives) => self.offer(alternatives, Event::OfferDeclined, "No problem. "),
            Err(e) => self.fail(e.into()),
        }
    }

    /// A different service changes the appointment length, so the offers no longer apply.
    fn change_service(&mut self, proposal: &SlotUpdateProposal) -> SystemResponse {
        let threshold = self.engine.profile.policy.confidence_threshold;
        let report = merge(&mut self.request, proposal, threshold);
        self.offers.clear();
        self.offer_rounds = 0;
        self.transition(Event::Corrected);
        if let Err(e) = self.check_request_hours() {
            return self.fail(e);
        }
        self.advance_collecting(&report)
    }

    fn pick_offer(&self, proposal: &SlotUpdateProposal) -> Option<AlternativeSlot> {
        if let Some(index) = proposal.choice {
            return self.offers.get(index).copied();
        }
        if let Some(time) = proposal.time.as_ref().map(|c| c.value) {
            let date = proposal.date.as_ref().map(|c| c.value);
            return self
                .offers
                .iter()
                .find(|o| o.time == time && date.map_or(true, |d| d == o.date))
                .copied();
        }
        if proposal.affirmation == Some(true) && !proposal.has_values() {
            return self.offers.first().copied();
        }
        None
    }

    /// The customer named a different time; search from there and take it if it is free.
    fn counter_offer(&mut self, proposal: &SlotUpdateProposal) -> SystemResponse {
        let Some((start, end)) = self.request.interval(&self.engine.profile) else {
            return self.fail(BookingError::NoAlternativesAvailable);
        };
        let date = proposal.date.as_ref().map(|c| c.value).unwrap_or(start.date());
        let time = proposal
            .time
            .as_ref()
            .map(|c| c.value)
            .unwrap_or(self.engine.profile.hours.open);
        let from = date.and_time(time);

        let alternatives = match self.engine.resolver.alternatives_from(from, end - start) {
            Ok(alternatives) => alternatives,
            Err(e) => return self.fail(e.into()),
        };

        if proposal.time.is_some() {
            if let Some(first) = alternatives.first().copied().filter(|a| a.start() == from) {
                return self.accept(first);
            }
        }

        self.offer_rounds += 1;
        if self.offer_rounds >= self.engine.profile.policy.max_offer_rounds {
            return self.fail(BookingError::NoAlternativesAvailable);
        }
        self.offer(alternatives, Event::OfferDeclined, "Sorry, that time isn't available. ")
    }

    fn accept(&mut self, pick: AlternativeSlot) -> SystemResponse {
        if self.request.date.value() != Some(&pick.date) {
            self.request.date.set_tentative(pick.date);
        }
        self.request.time.set_tentative(pick.time);
        self.offers.clear();
        self.confirm_attempts = 0;
        self.transition(Event::AlternativeSelected);
        self.confirm_prompt("Great. ")
    }

    fn finalize(&mut self) -> SystemResponse {
        if let Err(e) = self.check_request_hours() {
            return self.fail(e);
        }

        let now = self.engine.clock.now();
        let Some(appointment) = self.request.to_appointment(&self.customer, &self.engine.profile, now) else {
            return self.fail(BookingError::PersistenceFailure(
                "confirmed request could not be turned into an appointment".to_string(),
            ));
        };

        match self.engine.resolver.check_conflict(&appointment) {
            Ok(ConflictCheck::Clear) => self.commit(appointment),
            Ok(ConflictCheck::Conflict { alternatives }) => {
                self.offer(alternatives, Event::SlotTaken, "Sorry, that time is already booked. ")
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn commit(&mut self, appointment: Appointment) -> SystemResponse {
        let stored = match self.engine.store.write(&appointment) {
            Ok(WriteOutcome::Created) => appointment,
            Ok(WriteOutcome::AlreadyBooked { id }) => {
                tracing::info!(session_id = %self.id, appointment_id = %id, "booking already on file");
                match self.engine.store.get(&id) {
                    Ok(Some(existing)) => existing,
                    _ => Appointment { id, ..appointment },
                }
            }
            Err(e) => return self.fail(e.into()),
        };

        self.transition(Event::Committed);
        let text = format!(
            "You're all set! Your {} is booked for {} at {}. See you then.",
            stored.service.to_lowercase(),
            stored.start.format("%A, %B %-d"),
            stored.start.format("%H:%M"),
        );
        self.appointment = Some(stored.clone());
        SystemResponse::new(ResponseKind::Booked, self.phase, text).with_appointment(stored)
    }

    fn offer(&mut self, alternatives: Vec<AlternativeSlot>, event: Event, prefix: &str) -> SystemResponse {
        if alternatives.is_empty() {
            return self.fail(BookingError::NoAlternativesAvailable);
        }

        self.offers = alternatives;
        self.transition(event);
        let text = format!("{prefix}{}", self.offer_question());
        SystemResponse::new(ResponseKind::Offer, self.phase, text).with_alternatives(self.offers.clone())
    }

    fn offer_question(&self) -> String {
        let described: Vec<String> = self.offers.iter().map(|o| o.describe()).collect();
        match described.as_slice() {
            [only] => format!("The next opening is {only}. Would that work?"),
            [init @ .., last] => format!("I can offer {} or {last}. Would either of those work?", init.join(", ")),
            [] => String::new(),
        }
    }

    fn escalate(&mut self, reason: EscalationReason) -> SystemResponse {
        let message = escalation::escalate(reason, &self.customer, &self.request);
        tracing::warn!(
            session_id = %self.id,
            reason = reason.as_str(),
            handoff = %message.handoff_note,
            "escalating to staff"
        );
        self.escalation = Some(reason);
        self.transition(Event::Escalate(reason));
        SystemResponse::new(ResponseKind::Escalated, self.phase, message.text).with_escalation(reason)
    }

    /// Maps a component failure onto the state machine.
    fn fail(&mut self, err: BookingError) -> SystemResponse {
        tracing::warn!(session_id = %self.id, error = %err, "booking step failed");

        if let Some(reason) = err.escalation_reason() {
            return self.escalate(reason);
        }

        match err {
            BookingError::BusinessHoursViolation { slot, message } => {
                self.request.clear(slot);
                self.transition(Event::HoursViolation);
                self.awaiting = self.request.missing();
                SystemResponse::new(ResponseKind::Prompt, self.phase, message).with_missing(self.awaiting.clone())
            }
            BookingError::SlotConflict => {
                let Some((start, end)) = self.request.interval(&self.engine.profile) else {
                    return self.escalate(EscalationReason::NoAlternatives);
                };
                let step = Duration::minutes(self.engine.profile.booking_slots.interval_minutes);
                match self.engine.resolver.alternatives_from(start + step, end - start) {
                    Ok(alternatives) => {
                        self.offer(alternatives, Event::SlotTaken, "Sorry, that time was just taken. ")
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            BookingError::ExtractionAmbiguous(slot) => {
                self.awaiting = self.request.missing();
                self.missing_prompt(&format!("Sorry, I didn't quite catch the {}. ", slot.as_str()))
            }
            // the rest always carry an escalation reason
            _ => self.escalate(EscalationReason::UpstreamFailure),
        }
    }

    fn check_request_hours(&self) -> Result<(), BookingError> {
        if let Some(date) = self.request.date.value() {
            self.engine.resolver.check_upcoming(*date, self.request.start())?;
        }
        let Some(start) = self.request.start() else {
            return Ok(());
        };
        // Without a service only the start has to fall inside opening hours.
        let end = self
            .request
            .interval(&self.engine.profile)
            .map(|(_, end)| end)
            .unwrap_or(start + Duration::minutes(1));
        self.engine.resolver.check_hours(&start, &end)
    }

    fn answer_info(&mut self, topic: InfoTopic) -> SystemResponse {
        let profile = &self.engine.profile;
        let info = match topic {
            InfoTopic::Hours => format!("We're open {}.", profile.hours.to_human_readable()),
            InfoTopic::Pricing => {
                let known = self.request.service.value().and_then(|s| profile.service(s));
                match known {
                    Some(def) if def.price.is_some() => {
                        format!("{} is {}.", def.name, def.price.as_deref().unwrap_or_default())
                    }
                    _ => {
                        let prices: Vec<String> = profile
                            .services
                            .iter()
                            .filter_map(|s| s.price.as_ref().map(|p| format!("{} {p}", s.name)))
                            .collect();
                        if prices.is_empty() {
                            "Our staff can give you a quote when you come in.".to_string()
                        } else {
                            format!("Our prices are: {}.", prices.join(", "))
                        }
                    }
                }
            }
        };

        let follow_up = match self.phase {
            Phase::Confirming => self.confirm_question(),
            Phase::ResolvingConflict => self.offer_question(),
            _ => self.missing_question(),
        };
        SystemResponse::new(ResponseKind::Info, self.phase, format!("{info} {follow_up}"))
            .with_missing(self.request.missing())
            .with_alternatives(self.offers.clone())
    }

    fn confirm_question(&self) -> String {
        format!("Just to confirm: {}. Is that right?", self.request.describe())
    }

    fn confirm_prompt(&self, prefix: &str) -> SystemResponse {
        SystemResponse::new(
            ResponseKind::Confirm,
            self.phase,
            format!("{prefix}{}", self.confirm_question()),
        )
    }

    fn missing_question(&self) -> String {
        let missing = self.request.missing();
        if missing.contains(&SlotName::Service) {
            return format!(
                "Which service would you like? We offer {}.",
                self.engine.profile.service_names().join(", ")
            );
        }
        match (missing.contains(&SlotName::Date), missing.contains(&SlotName::Time)) {
            (true, true) => "What day and time would you like to come in?".to_string(),
            (true, false) => "What day would you like to come in?".to_string(),
            (false, true) => "What time works best for you?".to_string(),
            (false, false) => self.confirm_question(),
        }
    }

    fn missing_prompt(&self, prefix: &str) -> SystemResponse {
        SystemResponse::new(
            ResponseKind::Prompt,
            self.phase,
            format!("{prefix}{}", self.missing_question()),
        )
        .with_missing(self.request.missing())
    }

    fn transition(&mut self, event: Event) {
        let prior = self.phase;
        let Some(new) = next_phase(prior, event) else {
            tracing::error!(session_id = %self.id, prior = prior.as_str(), event = event.as_str(), "transition not allowed");
            return;
        };

        self.phase = new;
        self.engine.audit.record_transition(&TransitionEvent {
            session_id: self.id.clone(),
            prior,
            new,
            reason: event.as_str().to_string(),
            at: self.engine.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SearchSettings, SlotState};
    use crate::services::ai::{FieldGuess, InterpretContext, Interpretation};
    use crate::services::audit::TracingAuditLog;
    use crate::services::calendar_store::{IcsCalendarStore, StoreError};
    use crate::services::clock::FixedClock;
    use crate::services::usage::Unmetered;
    use async_trait::async_trait;
    use chrono::{NaiveDateTime, NaiveTime};

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn temp_store() -> Arc<IcsCalendarStore> {
        let path = std::env::temp_dir().join(format!("receptionist-{}.ics", uuid::Uuid::new_v4()));
        Arc::new(IcsCalendarStore::open(&path, &BusinessProfile::default()).unwrap())
    }

    fn engine_for(
        profile: BusinessProfile,
        now: &str,
        store: Arc<dyn CalendarStore>,
        interpreter: Option<Arc<dyn Interpreter>>,
    ) -> Arc<BookingEngine> {
        Arc::new(BookingEngine::new(
            Arc::new(profile),
            store,
            interpreter,
            Arc::new(Unmetered),
            Arc::new(TracingAuditLog),
            Arc::new(FixedClock::new(dt(now))),
            StdDuration::from_millis(200),
        ))
    }

    fn engine_with(store: Arc<dyn CalendarStore>, interpreter: Option<Arc<dyn Interpreter>>) -> Arc<BookingEngine> {
        // Sunday morning; "tomorrow" is Monday 2024-06-10
        engine_for(BusinessProfile::default(), "2024-06-09 10:00", store, interpreter)
    }

    fn oil_change(customer: &str, start: &str) -> Appointment {
        Appointment::new(customer, "Oil Change", dt(start), Duration::minutes(30), dt("2024-06-01 08:00"))
    }

    struct VagueInterpreter;

    #[async_trait]
    impl Interpreter for VagueInterpreter {
        async fn interpret(&self, _utterance: &str, _context: &InterpretContext) -> anyhow::Result<Interpretation> {
            Ok(Interpretation {
                service: Some(FieldGuess {
                    value: "Oil Change".to_string(),
                    confidence: 0.3,
                }),
                tokens_used: 50,
                ..Default::default()
            })
        }
    }

    struct BrokenInterpreter;

    #[async_trait]
    impl Interpreter for BrokenInterpreter {
        async fn interpret(&self, _utterance: &str, _context: &InterpretContext) -> anyhow::Result<Interpretation> {
            anyhow::bail!("503 service unavailable")
        }
    }

    struct ReadOnlyStore;

    impl CalendarStore for ReadOnlyStore {
        fn write(&self, _appointment: &Appointment) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Persistence("read-only file system".to_string()))
        }

        fn list_between(&self, _start: NaiveDateTime, _end: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
            Ok(vec![])
        }

        fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_terminal_phases_accept_no_events() {
        let events = [
            Event::Incomplete,
            Event::RequestComplete,
            Event::Corrected,
            Event::Unclear,
            Event::HoursViolation,
            Event::SlotTaken,
            Event::OfferDeclined,
            Event::AlternativeSelected,
            Event::Committed,
            Event::Escalate(EscalationReason::UpstreamFailure),
        ];
        for event in events {
            assert_eq!(next_phase(Phase::Escalated, event), None);
            assert_eq!(next_phase(Phase::Completed, event), None);
        }
        assert_eq!(next_phase(Phase::Collecting, Event::Committed), None);
        assert_eq!(
            next_phase(Phase::ResolvingConflict, Event::Escalate(EscalationReason::NoAlternatives)),
            Some(Phase::Escalated)
        );
    }

    #[tokio::test]
    async fn test_books_in_two_turns() {
        let store = temp_store();
        let mut session = CallSession::new(engine_with(store.clone(), None), "+16475551234");

        let reply = session.handle("I need an oil change tomorrow at 2").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(reply.phase, Phase::Confirming);
        assert_eq!(reply.text, "Just to confirm: an oil change on 2024-06-10 at 14:00. Is that right?");

        let reply = session.handle("yes please").await;
        assert_eq!(reply.kind, ResponseKind::Booked);
        assert_eq!(session.phase(), Phase::Completed);

        let stored = store.list_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].start, dt("2024-06-10 14:00"));
        assert_eq!(stored[0].end, dt("2024-06-10 14:30"));
        assert_eq!(stored[0].service, "Oil Change");
        assert_eq!(reply.appointment.unwrap().id, stored[0].id);
        assert_eq!(session.snapshot().history.len(), 2);
    }

    #[tokio::test]
    async fn test_prompts_only_for_missing_fields() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");

        let reply = session.handle("an oil change please").await;
        assert_eq!(reply.kind, ResponseKind::Prompt);
        assert_eq!(reply.missing, vec![SlotName::Date, SlotName::Time]);
        assert!(reply.text.ends_with("What day and time would you like to come in?"));

        let reply = session.handle("tomorrow").await;
        assert_eq!(reply.missing, vec![SlotName::Time]);

        let reply = session.handle("10am").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(session.request().time.value(), Some(&NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_three_low_confidence_service_turns_escalate() {
        let interpreter: Arc<dyn Interpreter> = Arc::new(VagueInterpreter);
        let mut session = CallSession::new(engine_with(temp_store(), Some(interpreter)), "+16475551234");

        for _ in 0..2 {
            let reply = session.handle("uh, the thing with the engine stuff").await;
            assert_eq!(reply.kind, ResponseKind::Prompt);
            assert_eq!(session.request().state_of(SlotName::Service), SlotState::Unset);
        }

        let reply = session.handle("you know, the usual").await;
        assert_eq!(reply.kind, ResponseKind::Escalated);
        assert_eq!(reply.escalation, Some(EscalationReason::LowConfidenceExhausted));
        assert_eq!(session.phase(), Phase::Escalated);
        assert!(session.snapshot().escalated);
    }

    #[tokio::test]
    async fn test_upstream_failure_escalates_with_handoff_text() {
        let interpreter: Arc<dyn Interpreter> = Arc::new(BrokenInterpreter);
        let mut session = CallSession::new(engine_with(temp_store(), Some(interpreter)), "+16475551234");

        let reply = session.handle("my car is making a weird noise").await;
        assert_eq!(reply.escalation, Some(EscalationReason::UpstreamFailure));
        assert_eq!(
            reply.text,
            "I'm having trouble completing that booking. I can transfer you to a human staff member for help."
        );
    }

    #[tokio::test]
    async fn test_conflict_offers_alternatives_and_books_pick() {
        let store = temp_store();
        store.write(&oil_change("+19995550000", "2024-06-10 14:00")).unwrap();
        let mut session = CallSession::new(engine_with(store.clone(), None), "+16475551234");

        session.handle("oil change tomorrow at 2pm").await;
        let reply = session.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Offer);
        assert_eq!(session.phase(), Phase::ResolvingConflict);
        assert_eq!(
            reply.alternatives,
            vec![
                AlternativeSlot::at(dt("2024-06-10 14:30")),
                AlternativeSlot::at(dt("2024-06-10 15:00")),
            ]
        );

        let reply = session.handle("the first one").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(session.request().state_of(SlotName::Service), SlotState::Confirmed);
        assert_eq!(session.request().state_of(SlotName::Date), SlotState::Confirmed);
        assert_eq!(session.request().state_of(SlotName::Time), SlotState::Tentative);

        let reply = session.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Booked);
        assert_eq!(reply.appointment.unwrap().start, dt("2024-06-10 14:30"));
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_declined_offers_escalate_and_never_complete() {
        let store = temp_store();
        store.write(&oil_change("+19995550000", "2024-06-10 14:00")).unwrap();
        let mut session = CallSession::new(engine_with(store.clone(), None), "+16475551234");

        session.handle("oil change tomorrow at 14:00").await;
        session.handle("yes").await;

        let reply = session.handle("no").await;
        assert_eq!(reply.kind, ResponseKind::Offer);
        assert_eq!(
            reply.alternatives,
            vec![
                AlternativeSlot::at(dt("2024-06-10 15:30")),
                AlternativeSlot::at(dt("2024-06-10 16:00")),
            ]
        );

        let reply = session.handle("no, neither").await;
        assert_eq!(reply.escalation, Some(EscalationReason::NoAlternatives));
        assert_eq!(session.phase(), Phase::Escalated);

        let reply = session.handle("yes, the first one").await;
        assert_eq!(reply.kind, ResponseKind::Rejected);
        assert_eq!(session.phase(), Phase::Escalated);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counter_offer_with_free_time_is_accepted() {
        let store = temp_store();
        store.write(&oil_change("+19995550000", "2024-06-10 14:00")).unwrap();
        let mut session = CallSession::new(engine_with(store, None), "+16475551234");

        session.handle("oil change tomorrow at 2pm").await;
        session.handle("yes").await;
        let reply = session.handle("how about 4pm instead").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(session.request().time.value(), Some(&NaiveTime::from_hms_opt(16, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_retried_booking_is_idempotent() {
        let store = temp_store();
        let engine = engine_with(store.clone(), None);

        let mut first = CallSession::new(engine.clone(), "+16475551234");
        first.handle("oil change tomorrow at 2").await;
        let booked = first.handle("yes").await.appointment.unwrap();

        let mut retry = CallSession::new(engine, "+16475551234");
        retry.handle("oil change tomorrow at 2").await;
        let reply = retry.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Booked);
        assert_eq!(reply.appointment.unwrap().id, booked.id);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_session_for_same_slot_gets_offers() {
        let store = temp_store();
        let engine = engine_with(store.clone(), None);

        let mut a = CallSession::new(engine.clone(), "+16475551234");
        let mut b = CallSession::new(engine, "+14165550000");
        a.handle("oil change tomorrow at 2").await;
        b.handle("oil change tomorrow at 2").await;

        assert_eq!(a.handle("yes").await.kind, ResponseKind::Booked);
        assert_eq!(b.handle("yes").await.kind, ResponseKind::Offer);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bare_no_then_field_change() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");
        session.handle("oil change tomorrow at 2").await;

        let reply = session.handle("no").await;
        assert_eq!(reply.phase, Phase::Collecting);
        assert!(reply.text.contains("What would you like to change"));
        assert!(session.request().is_complete());

        let reply = session.handle("the time").await;
        assert_eq!(reply.missing, vec![SlotName::Time]);

        let reply = session.handle("3pm").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(reply.text, "Just to confirm: an oil change on 2024-06-10 at 15:00. Is that right?");
    }

    #[tokio::test]
    async fn test_inline_correction_reconfirms() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");
        session.handle("oil change tomorrow at 2").await;

        let reply = session.handle("no, make it 11am").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(session.phase(), Phase::Confirming);
        assert_eq!(session.request().time.value(), Some(&NaiveTime::from_hms_opt(11, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_business_hours_violation_reprompts() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");

        let reply = session.handle("oil change tomorrow at 8pm").await;
        assert_eq!(reply.kind, ResponseKind::Prompt);
        assert_eq!(reply.phase, Phase::Collecting);
        assert!(reply.text.contains("outside our business hours"));
        assert_eq!(reply.missing, vec![SlotName::Time]);

        let reply = session.handle("oil change on sunday at 10").await;
        assert!(reply.text.contains("closed on Sundays"));
        assert_eq!(session.request().state_of(SlotName::Date), SlotState::Unset);

        let reply = session.handle("tomorrow at 10").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
    }

    #[tokio::test]
    async fn test_persistence_failure_escalates() {
        let mut session = CallSession::new(engine_with(Arc::new(ReadOnlyStore), None), "+16475551234");
        session.handle("oil change tomorrow at 2").await;

        let reply = session.handle("yes").await;
        assert_eq!(reply.escalation, Some(EscalationReason::PersistenceFailure));
        assert_eq!(session.phase(), Phase::Escalated);
        assert!(session.snapshot().appointment.is_none());
    }

    #[tokio::test]
    async fn test_info_question_does_not_count_as_clarification() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");
        session.handle("an oil change").await;

        for _ in 0..3 {
            let reply = session.handle("what are your hours?").await;
            assert_eq!(reply.kind, ResponseKind::Info);
            assert!(reply.text.starts_with("We're open Mon, Tue, Wed, Thu, Fri 09:00-17:00."));
        }
        assert_eq!(session.phase(), Phase::Collecting);
    }

    #[tokio::test]
    async fn test_time_already_passed_today_reprompts() {
        // Monday afternoon
        let engine = engine_for(BusinessProfile::default(), "2024-06-10 15:00", temp_store(), None);
        let mut session = CallSession::new(engine, "+16475551234");

        let reply = session.handle("oil change today at 9am").await;
        assert_eq!(reply.kind, ResponseKind::Prompt);
        assert_eq!(reply.phase, Phase::Collecting);
        assert!(reply.text.contains("already passed"));
        assert_eq!(reply.missing, vec![SlotName::Time]);

        let reply = session.handle("4pm").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(reply.text, "Just to confirm: an oil change on 2024-06-10 at 16:00. Is that right?");
    }

    #[tokio::test]
    async fn test_answered_turn_does_not_use_up_clarifications() {
        let mut session = CallSession::new(engine_with(temp_store(), None), "+16475551234");
        session.handle("an oil change please").await;

        let reply = session.handle("tomorrow").await;
        assert_eq!(reply.missing, vec![SlotName::Time]);

        for _ in 0..2 {
            let reply = session.handle("hmm").await;
            assert_eq!(reply.kind, ResponseKind::Prompt);
            assert_eq!(reply.missing, vec![SlotName::Time]);
        }
        assert_eq!(session.phase(), Phase::Collecting);

        let reply = session.handle("hmm").await;
        assert_eq!(reply.escalation, Some(EscalationReason::LowConfidenceExhausted));
    }

    #[tokio::test]
    async fn test_nothing_free_in_horizon_escalates() {
        let profile = BusinessProfile {
            booking_slots: SearchSettings {
                horizon_days: 0,
                ..SearchSettings::default()
            },
            ..BusinessProfile::default()
        };
        let store = temp_store();
        store
            .write(&Appointment::new(
                "+19995550000",
                "Brake Inspection",
                dt("2024-06-10 09:00"),
                Duration::hours(8),
                dt("2024-06-01 08:00"),
            ))
            .unwrap();
        let engine = engine_for(profile, "2024-06-09 10:00", store.clone(), None);
        let mut session = CallSession::new(engine, "+16475551234");

        session.handle("oil change tomorrow at 2").await;
        let reply = session.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Escalated);
        assert_eq!(reply.escalation, Some(EscalationReason::NoAlternatives));
        assert_eq!(session.phase(), Phase::Escalated);

        let reply = session.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Rejected);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_change_while_offered_reconfirms() {
        let store = temp_store();
        store.write(&oil_change("+19995550000", "2024-06-10 14:00")).unwrap();
        let mut session = CallSession::new(engine_with(store, None), "+16475551234");

        session.handle("oil change tomorrow at 2pm").await;
        let reply = session.handle("yes").await;
        assert_eq!(reply.kind, ResponseKind::Offer);

        let reply = session.handle("actually make it a brake inspection").await;
        assert_eq!(reply.kind, ResponseKind::Confirm);
        assert_eq!(session.phase(), Phase::Confirming);
        assert_eq!(session.request().service.value().map(String::as_str), Some("Brake Inspection"));
        assert_eq!(
            reply.text,
            "Just to confirm: a brake inspection on 2024-06-10 at 14:00. Is that right?"
        );
    }
}
