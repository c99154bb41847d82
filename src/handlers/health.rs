use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::Phase;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    live_sessions: usize,
    completed_sessions: i64,
    escalated_sessions: i64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let (completed_sessions, escalated_sessions) = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        (
            queries::count_sessions_by_phase(&db, Phase::Completed)?,
            queries::count_sessions_by_phase(&db, Phase::Escalated)?,
        )
    };

    Ok(Json(HealthResponse {
        status: "ok",
        live_sessions: state.registry.len(),
        completed_sessions,
        escalated_sessions,
    }))
}
