use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Form;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TwilioWebhookForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
}

/// Twilio request signature: base64 HMAC-SHA1 over the URL followed by every
/// parameter name and value, sorted by name.
pub fn twilio_signature(auth_token: &str, url: &str, params: &[(&str, &str)]) -> Option<String> {
    let mut data = url.to_string();
    let mut sorted_params = params.to_vec();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in &sorted_params {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(data.as_bytes());
    Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn webhook_url(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}/webhook/sms")
}

fn verify(auth_token: &str, headers: &HeaderMap, form: &TwilioWebhookForm) -> Result<(), AppError> {
    let signature = headers
        .get("x-twilio-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if signature.is_empty() {
        tracing::warn!("missing X-Twilio-Signature header");
        return Err(AppError::Forbidden("missing signature".to_string()));
    }

    let url = webhook_url(headers);
    let params = [
        ("From", form.from.as_str()),
        ("To", form.to.as_str()),
        ("Body", form.body.as_str()),
        ("MessageSid", form.message_sid.as_deref().unwrap_or("")),
    ];
    match twilio_signature(auth_token, &url, &params) {
        Some(expected) if expected == signature => Ok(()),
        _ => {
            tracing::warn!(url = %url, "invalid Twilio signature");
            Err(AppError::Forbidden("invalid signature".to_string()))
        }
    }
}

// POST /webhook/sms
pub async fn sms_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TwilioWebhookForm>,
) -> Result<Response, AppError> {
    // Empty token disables the check for local testing.
    if !state.config.twilio_auth_token.is_empty() {
        verify(&state.config.twilio_auth_token, &headers, &form)?;
    }

    let from = form.from.trim();
    let body = form.body.trim();
    if from.is_empty() {
        return Err(AppError::BadRequest("From is required".to_string()));
    }
    tracing::info!(from = %from, body = %body, "incoming SMS");

    let (session_id, response) = state.registry.handle_for_customer(from, body).await;
    tracing::debug!(session_id = %session_id, kind = ?response.kind, "SMS reply");

    Ok(twiml_response(&response.text))
}

fn twiml_response(message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        xml_escape(message)
    );
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
