use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::errors::AppError;
use crate::services::calendar::{render_calendar, render_event};
use crate::state::AppState;

// GET /calendar/feed.ics
pub async fn calendar_feed(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let appointments = state.store.list_all()?;
    let ics = render_calendar(&appointments, &state.profile.offset(), &state.profile.shop_name);
    Ok(([(header::CONTENT_TYPE, "text/calendar; charset=utf-8")], ics).into_response())
}

// GET /calendar/:appointment_id
pub async fn download_ics(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Response, AppError> {
    let appointment_id = raw_id.strip_suffix(".ics").unwrap_or(&raw_id);

    let appointment = state
        .store
        .get(appointment_id)?
        .ok_or_else(|| AppError::NotFound(format!("appointment {appointment_id}")))?;

    let ics = render_event(&appointment, &state.profile.offset(), &state.profile.shop_name);
    let disposition = format!("attachment; filename=\"appointment-{appointment_id}.ics\"");

    Ok((
        [
            (header::CONTENT_TYPE, "text/calendar; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        ics,
    )
        .into_response())
}
