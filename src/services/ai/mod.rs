pub mod groq;
pub mod interpret;
pub mod ollama;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::SlotName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub total_tokens: u64,
}

/// System prompt followed by the conversation, in the role/content shape both providers accept.
fn chat_messages(system_prompt: &str, messages: &[Message]) -> Vec<serde_json::Value> {
    std::iter::once(serde_json::json!({ "role": "system", "content": system_prompt }))
        .chain(
            messages
                .iter()
                .map(|m| serde_json::json!({ "role": m.role, "content": m.content })),
        )
        .collect()
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, system_prompt: &str, messages: &[Message]) -> anyhow::Result<ChatReply>;
}

/// One field as read by the interpreter, before it is checked against the catalog and calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGuess {
    pub value: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub service: Option<FieldGuess>,
    pub date: Option<FieldGuess>,
    pub time: Option<FieldGuess>,
    pub tokens_used: u64,
}

/// What the interpreter is told about the call so far.
#[derive(Debug, Clone)]
pub struct InterpretContext {
    pub today: NaiveDate,
    pub missing: Vec<SlotName>,
    pub known: String,
    pub services: Vec<String>,
    pub hours: String,
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(&self, utterance: &str, context: &InterpretContext) -> anyhow::Result<Interpretation>;
}
