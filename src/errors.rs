use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::models::{EscalationReason, SlotName};
use crate::services::calendar_store::StoreError;

/// Failures inside the booking flow. `CallSession` turns every one of these into a transition.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("could not make out the {}", .0.as_str())]
    ExtractionAmbiguous(SlotName),

    #[error("interpretation service failed: {0}")]
    ExtractionFailed(String),

    #[error("requested time overlaps an existing appointment")]
    SlotConflict,

    #[error("no alternative slots available")]
    NoAlternativesAvailable,

    #[error("calendar persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("{message}")]
    BusinessHoursViolation { slot: SlotName, message: String },
}

impl BookingError {
    /// Reason for the human handoff, or `None` when the session can recover by itself.
    pub fn escalation_reason(&self) -> Option<EscalationReason> {
        match self {
            BookingError::ExtractionAmbiguous(_)
            | BookingError::SlotConflict
            | BookingError::BusinessHoursViolation { .. } => None,
            BookingError::ExtractionFailed(_) => Some(EscalationReason::UpstreamFailure),
            BookingError::NoAlternativesAvailable => Some(EscalationReason::NoAlternatives),
            BookingError::PersistenceFailure(_) => Some(EscalationReason::PersistenceFailure),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(_) => BookingError::SlotConflict,
            other => BookingError::PersistenceFailure(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("calendar error: {0}")]
    Calendar(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Calendar(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
