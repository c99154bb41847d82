use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{SessionSnapshot, SystemResponse};
use crate::services::conversation::rejected;
use crate::state::AppState;

// POST /api/sessions
#[derive(Deserialize)]
pub struct OpenSessionRequest {
    pub customer: String,
}

#[derive(Serialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub greeting: SystemResponse,
}

pub async fn open_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Json<OpenSessionResponse>, AppError> {
    let customer = req.customer.trim();
    if customer.is_empty() {
        return Err(AppError::BadRequest("customer is required".to_string()));
    }

    let (session_id, greeting) = state.registry.open(customer);
    Ok(Json(OpenSessionResponse {
        session_id,
        greeting,
    }))
}

// POST /api/sessions/:id/messages
#[derive(Deserialize)]
pub struct MessageRequest {
    pub utterance: String,
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<SystemResponse>, AppError> {
    if let Some(response) = state.registry.handle(&id, &req.utterance).await {
        return Ok(Json(response));
    }

    // finished sessions are only kept in the archive
    let archived = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        queries::get_archived_session(&db, &id)?
    };
    archived
        .map(|snapshot| Json(rejected(snapshot.phase)))
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))
}

// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    if let Some(snapshot) = state.registry.snapshot(&id).await {
        return Ok(Json(snapshot));
    }

    let archived = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        queries::get_archived_session(&db, &id)?
    };
    archived
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))
}
