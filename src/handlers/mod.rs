use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod calendar;
pub mod health;
pub mod sessions;
pub mod webhook;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/sessions", post(sessions::open_session))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/sessions/:id/messages", post(sessions::post_message))
        .route("/webhook/sms", post(webhook::sms_webhook))
        .route("/calendar/feed.ics", get(calendar::calendar_feed))
        .route("/calendar/:appointment_id", get(calendar::download_ics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
