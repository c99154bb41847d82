use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::appointment::{AlternativeSlot, Appointment};
use super::booking::{BookingRequest, SlotName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Collecting,
    Confirming,
    ResolvingConflict,
    Escalated,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Collecting => "collecting",
            Phase::Confirming => "confirming",
            Phase::ResolvingConflict => "resolving_conflict",
            Phase::Escalated => "escalated",
            Phase::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(Phase::Collecting),
            "confirming" => Some(Phase::Confirming),
            "resolving_conflict" => Some(Phase::ResolvingConflict),
            "escalated" => Some(Phase::Escalated),
            "completed" => Some(Phase::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Escalated | Phase::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    LowConfidenceExhausted,
    NoAlternatives,
    PersistenceFailure,
    UpstreamFailure,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::LowConfidenceExhausted => "LOW_CONFIDENCE_EXHAUSTED",
            EscalationReason::NoAlternatives => "NO_ALTERNATIVES",
            EscalationReason::PersistenceFailure => "PERSISTENCE_FAILURE",
            EscalationReason::UpstreamFailure => "UPSTREAM_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Prompt,
    Confirm,
    Offer,
    Info,
    Booked,
    Escalated,
    Rejected,
}

/// What the core hands back to an I/O adapter for one inbound utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemResponse {
    pub kind: ResponseKind,
    pub text: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<SlotName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<AlternativeSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment: Option<Appointment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationReason>,
}

impl SystemResponse {
    pub fn new(kind: ResponseKind, phase: Phase, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            phase,
            missing: vec![],
            alternatives: vec![],
            appointment: None,
            escalation: None,
        }
    }

    pub fn with_missing(mut self, missing: Vec<SlotName>) -> Self {
        self.missing = missing;
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<AlternativeSlot>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_appointment(mut self, appointment: Appointment) -> Self {
        self.appointment = Some(appointment);
        self
    }

    pub fn with_escalation(mut self, reason: EscalationReason) -> Self {
        self.escalation = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub utterance: String,
    pub response: String,
    pub at: NaiveDateTime,
}

/// One state-machine transition, as handed to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub session_id: String,
    pub prior: Phase,
    pub new: Phase,
    pub reason: String,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub customer: String,
    pub phase: Phase,
    pub request: BookingRequest,
    pub history: Vec<Turn>,
    pub escalated: bool,
    pub escalation: Option<EscalationReason>,
    pub appointment: Option<Appointment>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
