use serde::Serialize;

use crate::models::{BookingRequest, EscalationReason, SlotName};

/// Customer-facing handoff text plus a short note for the staff member picking the call up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationMessage {
    pub reason: EscalationReason,
    pub text: String,
    pub handoff_note: String,
}

/// Builds the handoff for a session. Pure; same inputs always give the same message.
pub fn escalate(reason: EscalationReason, customer: &str, request: &BookingRequest) -> EscalationMessage {
    let text = match reason {
        EscalationReason::LowConfidenceExhausted => {
            "I'm sorry, I'm having trouble understanding the details. Let me transfer you to a member of our team who can help."
        }
        EscalationReason::NoAlternatives => {
            "I'm sorry, I couldn't find an open slot that works. Let me transfer you to a member of our team to find a time."
        }
        EscalationReason::PersistenceFailure => {
            "I'm sorry, something went wrong while saving your booking. Let me transfer you to a member of our team to finish it."
        }
        EscalationReason::UpstreamFailure => {
            "I'm having trouble completing that booking. I can transfer you to a human staff member for help."
        }
    };

    EscalationMessage {
        reason,
        text: text.to_string(),
        handoff_note: handoff_note(reason, customer, request),
    }
}

fn handoff_note(reason: EscalationReason, customer: &str, request: &BookingRequest) -> String {
    let collected: Vec<String> = SlotName::ALL
        .into_iter()
        .filter_map(|slot| {
            let value = match slot {
                SlotName::Service => request.service.value().cloned(),
                SlotName::Date => request.date.value().map(|d| d.format("%Y-%m-%d").to_string()),
                SlotName::Time => request.time.value().map(|t| t.format("%H:%M").to_string()),
            }?;
            Some(format!("{}={}", slot.as_str(), value))
        })
        .collect();

    let collected = if collected.is_empty() {
        "nothing collected".to_string()
    } else {
        collected.join(", ")
    };
    format!("{} from {customer}: {collected}", reason.as_str())
}
