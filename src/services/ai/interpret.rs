use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{FieldGuess, InterpretContext, Interpretation, Interpreter, LlmProvider, Message};

const SYSTEM_PROMPT: &str = r#"You are a slot extraction engine for a phone receptionist that books service appointments. Read the customer's latest message and pull out the booking details it contains.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "service": {"value": "one of the listed services", "confidence": 0.0} or null,
  "date": {"value": "YYYY-MM-DD", "confidence": 0.0} or null,
  "time": {"value": "HH:MM in 24-hour time", "confidence": 0.0} or null
}

Rules:
- Only fill a field the message actually talks about; otherwise use null
- "service" must be copied exactly from the service list
- Resolve relative dates ("tomorrow", "next friday") against today's date
- "confidence" is between 0 and 1; use a low value when the customer is vague or unsure
- Never invent a value to fill a missing field
"#;

#[derive(Debug, Default, Deserialize)]
struct RawInterpretation {
    #[serde(default)]
    service: Option<FieldGuess>,
    #[serde(default)]
    date: Option<FieldGuess>,
    #[serde(default)]
    time: Option<FieldGuess>,
}

/// Interpreter backed by a chat-completion model.
pub struct LlmInterpreter {
    llm: Arc<dyn LlmProvider>,
}

impl LlmInterpreter {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

fn describe_context(context: &InterpretContext) -> String {
    let missing = context
        .missing
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Today: {} ({})\nServices: {}\nBusiness hours: {}\nAlready known: {}\nStill missing: {}",
        context.today.format("%Y-%m-%d"),
        context.today.format("%A"),
        context.services.join(", "),
        context.hours,
        if context.known.is_empty() { "nothing" } else { context.known.as_str() },
        if missing.is_empty() { "nothing" } else { missing.as_str() },
    )
}

#[async_trait]
impl Interpreter for LlmInterpreter {
    async fn interpret(&self, utterance: &str, context: &InterpretContext) -> anyhow::Result<Interpretation> {
        let system = format!("{SYSTEM_PROMPT}\nCall context:\n{}", describe_context(context));
        let messages = [Message {
            role: "user".to_string(),
            content: utterance.to_string(),
        }];

        let reply = self.llm.chat(&system, &messages).await?;
        let raw = parse_interpretation(&reply.content);

        Ok(Interpretation {
            service: raw.service.map(clamp),
            date: raw.date.map(clamp),
            time: raw.time.map(clamp),
            tokens_used: reply.total_tokens,
        })
    }
}

fn clamp(guess: FieldGuess) -> FieldGuess {
    FieldGuess {
        value: guess.value.trim().to_string(),
        confidence: if guess.confidence.is_finite() {
            guess.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        },
    }
}

fn parse_interpretation(response: &str) -> RawInterpretation {
    if let Ok(raw) = serde_json::from_str::<RawInterpretation>(response) {
        return raw;
    }

    // Strip markdown code fences
    let cleaned = response
        .trim()
        .strip_prefix("```json")
        .or_else(|| response.trim().strip_prefix("```"))
        .unwrap_or(response.trim());
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    if let Ok(raw) = serde_json::from_str::<RawInterpretation>(cleaned) {
        return raw;
    }

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            if let Ok(raw) = serde_json::from_str::<RawInterpretation>(&cleaned[start..=end]) {
                return raw;
            }
        }
    }

    tracing::warn!("failed to parse interpreter response as JSON, treating as empty");
    RawInterpretation::default()
}
